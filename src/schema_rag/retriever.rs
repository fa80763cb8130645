//! Semantic Schema Filter
//!
//! Narrows large schemas to the top-K tables most similar to the question.
//! Best-effort: any embedding failure falls back to the full schema.

use crate::error::Result;
use crate::schema::SchemaSnapshot;
use crate::schema_rag::embedder::Embedder;
use crate::schema_rag::vector_store::{Document, InMemoryVectorStore};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SemanticFilter {
    embedder: Arc<dyn Embedder>,
    /// Table indexes keyed by schema version, so a schema change re-embeds.
    indexes: Cache<String, Arc<InMemoryVectorStore>>,
    threshold: usize,
    top_k: usize,
}

impl SemanticFilter {
    pub fn new(embedder: Arc<dyn Embedder>, threshold: usize, top_k: usize) -> Self {
        Self {
            embedder,
            indexes: Cache::new(64),
            threshold,
            top_k: top_k.max(1),
        }
    }

    /// Tables to show the generator, or `None` for the whole schema.
    pub async fn select_tables(&self, snapshot: &SchemaSnapshot, question: &str) -> Option<Vec<String>> {
        if snapshot.table_count() <= self.threshold {
            return None;
        }
        match self.rank_tables(snapshot, question).await {
            Ok(tables) if !tables.is_empty() => {
                debug!("Semantic filter kept {} of {} tables", tables.len(), snapshot.table_count());
                Some(tables)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Semantic filter unavailable, using full schema: {}", e);
                None
            }
        }
    }

    async fn rank_tables(&self, snapshot: &SchemaSnapshot, question: &str) -> Result<Vec<String>> {
        let index = self
            .indexes
            .try_get_with(snapshot.version().to_string(), self.build_index(snapshot))
            .await
            .map_err(|e| (*e).clone())?;

        let query = self.embedder.embed(&[question.to_string()]).await?;
        let Some(query) = query.first() else {
            return Ok(Vec::new());
        };
        let results = index.search(query, self.top_k)?;
        Ok(results
            .into_iter()
            .filter_map(|r| r.document.metadata.get("name").cloned())
            .collect())
    }

    async fn build_index(&self, snapshot: &SchemaSnapshot) -> Result<Arc<InMemoryVectorStore>> {
        let tables: Vec<_> = snapshot.tables().collect();
        let texts: Vec<String> = tables.iter().map(|t| t.describe()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        let mut store = InMemoryVectorStore::new(dimension);
        for ((table, text), embedding) in tables.iter().zip(texts).zip(embeddings) {
            let mut metadata = HashMap::new();
            metadata.insert("type".to_string(), "table".to_string());
            metadata.insert("name".to_string(), table.name.clone());
            store.add_document(Document {
                id: format!("table:{}", table.name),
                text,
                metadata,
                embedding,
            })?;
        }
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{RawColumn, RawSchema, RawTable};
    use crate::error::EngineError;
    use crate::schema_rag::embedder::HashingEmbedder;
    use crate::schema_rag::vector_store::Embedding;
    use async_trait::async_trait;

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Embedding>> {
            Err(EngineError::GenerationFailed("embedding service down".into()))
        }
    }

    fn snapshot(tables: &[(&str, &[&str])]) -> SchemaSnapshot {
        let raw = RawSchema {
            tables: tables
                .iter()
                .map(|(name, cols)| RawTable {
                    name: name.to_string(),
                    columns: cols
                        .iter()
                        .map(|c| RawColumn {
                            name: c.to_string(),
                            data_type: "text".into(),
                            nullable: true,
                        })
                        .collect(),
                    primary_key: vec![],
                    foreign_keys: vec![],
                })
                .collect(),
        };
        SchemaSnapshot::build("ds", &raw)
    }

    #[tokio::test]
    async fn test_small_schema_is_not_filtered() {
        let filter = SemanticFilter::new(Arc::new(HashingEmbedder::default()), 5, 2);
        let snap = snapshot(&[("orders", &["id"]), ("customers", &["id"])]);
        assert!(filter.select_tables(&snap, "orders").await.is_none());
    }

    #[tokio::test]
    async fn test_large_schema_keeps_top_k() {
        let filter = SemanticFilter::new(Arc::new(HashingEmbedder::default()), 2, 1);
        let snap = snapshot(&[
            ("orders", &["id", "revenue"]),
            ("employees", &["id", "salary"]),
            ("warehouses", &["id", "capacity"]),
        ]);
        let kept = filter.select_tables(&snap, "total revenue of orders").await.unwrap();
        assert_eq!(kept, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_full_schema() {
        let filter = SemanticFilter::new(Arc::new(BrokenEmbedder), 1, 1);
        let snap = snapshot(&[("orders", &["id"]), ("customers", &["id"])]);
        assert!(filter.select_tables(&snap, "orders").await.is_none());
    }
}
