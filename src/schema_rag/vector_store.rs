//! Vector Store
//!
//! In-memory store with linear cosine search. Schemas that need the filter
//! have tens to hundreds of tables, so a flat scan is enough.

use crate::error::{EngineError, Result};
use std::collections::HashMap;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
    pub embedding: Embedding,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub document: Document,
    pub score: f32,
}

pub struct InMemoryVectorStore {
    documents: Vec<Document>,
    dimension: usize,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            documents: Vec::new(),
            dimension,
        }
    }

    pub fn add_document(&mut self, document: Document) -> Result<()> {
        if document.embedding.len() != self.dimension {
            return Err(EngineError::Schema(format!(
                "Embedding dimension {} doesn't match store dimension {}",
                document.embedding.len(),
                self.dimension
            )));
        }
        self.documents.push(document);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Top `top_k` documents by cosine similarity, best first.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        if query.len() != self.dimension {
            return Err(EngineError::Schema(format!(
                "Query embedding dimension {} doesn't match store dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let mut results: Vec<SearchResult> = self
            .documents
            .iter()
            .map(|doc| SearchResult {
                score: cosine_similarity(query, &doc.embedding),
                document: doc.clone(),
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        results.truncate(top_k);
        Ok(results)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, embedding: Embedding) -> Document {
        Document {
            id: id.to_string(),
            text: id.to_string(),
            metadata: HashMap::new(),
            embedding,
        }
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let mut store = InMemoryVectorStore::new(2);
        store.add_document(doc("x", vec![1.0, 0.0])).unwrap();
        store.add_document(doc("y", vec![0.0, 1.0])).unwrap();
        store.add_document(doc("xy", vec![1.0, 1.0])).unwrap();
        let results = store.search(&[1.0, 0.1], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document.id, "x");
        assert_eq!(results[1].document.id, "xy");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut store = InMemoryVectorStore::new(3);
        assert!(store.add_document(doc("bad", vec![1.0])).is_err());
        assert!(store.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_zero_vector_similarity() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
