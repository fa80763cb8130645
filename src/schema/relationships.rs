//! Relationship Detection
//!
//! Foreign-key metadata first; when a backend exposes none, a column named
//! `<singular-table>_id` or `<table>id` is taken as a probable reference to
//! that table's primary key.

use crate::connectors::{RawSchema, RawTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipSource {
    ForeignKey,
    NamingConvention,
}

/// Directed edge `from_table.from_column -> to_table.to_column`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub source: RelationshipSource,
}

type EdgeKey = (String, String, String, String);

pub fn detect_relationships(raw: &RawSchema) -> Vec<Relationship> {
    let mut edges: BTreeMap<EdgeKey, RelationshipSource> = BTreeMap::new();

    for table in &raw.tables {
        for fk in &table.foreign_keys {
            if fk.ref_table == table.name && fk.ref_column == fk.column {
                continue;
            }
            edges.insert(
                (
                    table.name.clone(),
                    fk.column.clone(),
                    fk.ref_table.clone(),
                    fk.ref_column.clone(),
                ),
                RelationshipSource::ForeignKey,
            );
        }
    }

    for table in &raw.tables {
        for column in &table.columns {
            let column_name = column.name.to_lowercase();
            for target in &raw.tables {
                if target.name == table.name {
                    continue;
                }
                let Some(target_key) = reference_key(target) else { continue };
                if !names_reference(&column_name, &target.name) {
                    continue;
                }
                // An explicit foreign key on the same column wins.
                let already_linked = edges
                    .keys()
                    .any(|(t, c, _, _)| t == &table.name && c == &column.name);
                if already_linked {
                    continue;
                }
                edges
                    .entry((
                        table.name.clone(),
                        column.name.clone(),
                        target.name.clone(),
                        target_key,
                    ))
                    .or_insert(RelationshipSource::NamingConvention);
            }
        }
    }

    edges
        .into_iter()
        .map(|((from_table, from_column, to_table, to_column), source)| Relationship {
            from_table,
            from_column,
            to_table,
            to_column,
            source,
        })
        .collect()
}

/// The column other tables would point at: a single-column primary key, else `id`.
fn reference_key(table: &RawTable) -> Option<String> {
    if table.primary_key.len() == 1 {
        return table.primary_key.first().cloned();
    }
    table
        .columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case("id"))
        .map(|c| c.name.clone())
}

fn names_reference(column: &str, table_name: &str) -> bool {
    let bare = table_name
        .rsplit('.')
        .next()
        .unwrap_or(table_name)
        .to_lowercase();
    column == format!("{}_id", singularize(&bare)) || column == format!("{}id", bare)
}

pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        format!("{}y", stem)
    } else if word.ends_with("sses") || word.ends_with("xes") || word.ends_with("ches") || word.ends_with("shes") {
        word[..word.len() - 2].to_string()
    } else if word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}
