//! Schema Snapshot
//!
//! Immutable point-in-time description of a data source. A refresh builds a
//! new snapshot and swaps it in whole; nothing mutates one after `build`.

use crate::connectors::{RawSchema, RawTable};
use crate::schema::relationships::{detect_relationships, Relationship, RelationshipSource};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

lazy_static! {
    static ref NUMERIC_TYPE: Regex = Regex::new(
        r"^(int|integer|bigint|smallint|tinyint|serial|bigserial|decimal|numeric|real|double|double precision|float|money|number|[iuf](8|16|32|64)|decimal\(.*\)|numeric\(.*\))$"
    ).unwrap();
    static ref TEMPORAL_TYPE: Regex =
        Regex::new(r"^(date|time|timestamp|datetime|interval)").unwrap();
    static ref TEMPORAL_NAME: Regex =
        Regex::new(r"(^|_)(date|time|timestamp|month|year|day|week|quarter)($|_)|_at$|_on$").unwrap();
    static ref CATEGORICAL_NAME: Regex = Regex::new(
        r"(^|_)(type|status|category|kind|region|country|state|city|segment|tier|channel|gender|code)$"
    ).unwrap();
    static ref CATEGORICAL_TYPE: Regex = Regex::new(r"^(bool|boolean|enum|user-defined|char\(\d\))").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Numeric,
    Temporal,
    Categorical,
    Text,
}

/// Infer a column's semantic type from its backend type and name.
pub fn infer_semantic_type(name: &str, data_type: &str) -> SemanticType {
    let ty = data_type.trim().to_lowercase();
    let name = name.to_lowercase();
    if NUMERIC_TYPE.is_match(&ty) {
        return SemanticType::Numeric;
    }
    if TEMPORAL_TYPE.is_match(&ty) {
        return SemanticType::Temporal;
    }
    if CATEGORICAL_TYPE.is_match(&ty) {
        return SemanticType::Categorical;
    }
    if TEMPORAL_NAME.is_match(&name) {
        return SemanticType::Temporal;
    }
    if CATEGORICAL_NAME.is_match(&name) {
        return SemanticType::Categorical;
    }
    SemanticType::Text
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    fn from_raw(raw: &RawTable) -> Self {
        Self {
            name: raw.name.clone(),
            columns: raw
                .columns
                .iter()
                .map(|c| ColumnInfo {
                    name: c.name.clone(),
                    semantic_type: infer_semantic_type(&c.name, &c.data_type),
                    data_type: c.data_type.clone(),
                    nullable: c.nullable,
                    primary_key: raw.primary_key.iter().any(|pk| pk == &c.name),
                })
                .collect(),
        }
    }

    /// Short description used for embeddings and prompts.
    pub fn describe(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.data_type))
            .collect();
        format!("Table {} with columns: {}", self.name, columns.join(", "))
    }
}

#[derive(Serialize)]
struct VersionInput<'a> {
    tables: &'a BTreeMap<String, TableInfo>,
    relationships: &'a [Relationship],
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    data_source_id: String,
    tables: BTreeMap<String, TableInfo>,
    relationships: Vec<Relationship>,
    version: String,
    built_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn build(data_source_id: impl Into<String>, raw: &RawSchema) -> Self {
        let tables: BTreeMap<String, TableInfo> = raw
            .tables
            .iter()
            .map(|t| (t.name.clone(), TableInfo::from_raw(t)))
            .collect();
        let relationships = detect_relationships(raw);
        let version = content_version(&tables, &relationships);
        Self {
            data_source_id: data_source_id.into(),
            tables,
            relationships,
            version,
            built_at: Utc::now(),
        }
    }

    pub fn data_source_id(&self) -> &str {
        &self.data_source_id
    }

    /// Content hash; identical structure yields an identical version.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Render tables (all, or only `only`) in the prompt layout the generator expects.
    pub fn render_for_prompt(&self, only: Option<&[String]>) -> String {
        let selected: Vec<&TableInfo> = match only {
            Some(names) => names.iter().filter_map(|n| self.tables.get(n)).collect(),
            None => self.tables.values().collect(),
        };

        let mut out = String::new();
        for table in &selected {
            out.push_str(&format!("Table: {}\nColumns:\n", table.name));
            for column in &table.columns {
                out.push_str(&format!("  - {}: {}", column.name, column.data_type));
                if column.primary_key {
                    out.push_str(" [PK]");
                }
                if let Some(rel) = self
                    .relationships
                    .iter()
                    .find(|r| r.from_table == table.name && r.from_column == column.name)
                {
                    out.push_str(&format!(" [FK -> {}.{}]", rel.to_table, rel.to_column));
                }
                out.push('\n');
            }
            out.push('\n');
        }

        let relevant: Vec<&Relationship> = self
            .relationships
            .iter()
            .filter(|r| {
                selected.iter().any(|t| t.name == r.from_table)
                    && selected.iter().any(|t| t.name == r.to_table)
            })
            .collect();
        if !relevant.is_empty() {
            out.push_str("Relationships:\n");
            for rel in relevant {
                let note = match rel.source {
                    RelationshipSource::ForeignKey => "",
                    RelationshipSource::NamingConvention => " (inferred)",
                };
                out.push_str(&format!(
                    "  - {}.{} -> {}.{}{}\n",
                    rel.from_table, rel.from_column, rel.to_table, rel.to_column, note
                ));
            }
        }
        out
    }

    /// Every table and column name, for fuzzy "did you mean" matching.
    pub fn identifiers(&self) -> Vec<String> {
        let mut names = Vec::new();
        for table in self.tables.values() {
            names.push(table.name.clone());
            names.extend(table.columns.iter().map(|c| c.name.clone()));
        }
        names.sort();
        names.dedup();
        names
    }
}

fn content_version(tables: &BTreeMap<String, TableInfo>, relationships: &[Relationship]) -> String {
    let input = VersionInput {
        tables,
        relationships,
    };
    let canonical = serde_json::to_vec(&input).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}
