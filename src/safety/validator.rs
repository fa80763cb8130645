//! Safety Validator
//!
//! Hard gate between generation and execution. A query passes only if it
//! is a single, well-formed read operation; every problem found is reported,
//! not just the first. Passing queries get their row limit enforced.

use crate::connectors::Dialect;
use crate::error::{EngineError, Result};
use crate::generator::GeneratedQuery;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlparser::ast::{Expr, SetExpr, Statement, Value as SqlValue};
use sqlparser::dialect::{Dialect as SqlDialect, GenericDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use tracing::{debug, warn};

lazy_static! {
    static ref MUTATING_KEYWORD: Regex = Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|truncate|create|grant|revoke|merge)\b"
    )
    .unwrap();
    static ref REPLACE_INTO: Regex = Regex::new(r"(?i)\breplace\s+into\b").unwrap();
}

const DOCUMENT_QUERY_KEYS: &[&str] = &["collection", "filter", "projection", "sort", "limit", "pipeline"];
const FORBIDDEN_STAGES: &[&str] = &["$out", "$merge"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStrategy {
    /// The query's own limit was within bounds.
    Kept,
    /// An oversized or non-literal limit was replaced.
    Rewritten,
    /// No limit was present; one was added.
    Appended,
    /// The backend form could not carry a limit; rows are cut after fetch.
    ClientSide,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidatedQuery {
    pub text: String,
    pub dialect: Dialect,
    pub applied_limit: usize,
    pub limit_strategy: LimitStrategy,
}

impl ValidatedQuery {
    /// Rows to request from the backend. Limits the engine imposed fetch one
    /// extra row so a cut result can be told apart from an exact fit; a limit
    /// the query carried itself is never reported as a cut.
    pub fn fetch_limit(&self) -> usize {
        match self.limit_strategy {
            LimitStrategy::Kept => self.applied_limit,
            _ => self.applied_limit.saturating_add(1),
        }
    }
}

pub struct SafetyValidator {
    max_rows: usize,
}

impl SafetyValidator {
    pub fn new(max_rows: usize) -> Self {
        Self {
            max_rows: max_rows.max(1),
        }
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn validate(&self, query: &GeneratedQuery) -> Result<ValidatedQuery> {
        let outcome = match query.dialect() {
            Dialect::Document => self.validate_document(query.text()),
            dialect => self.validate_sql(query.text(), dialect),
        };
        match outcome {
            Ok(validated) => {
                debug!(
                    "Query passed validation (limit {} via {:?})",
                    validated.applied_limit, validated.limit_strategy
                );
                Ok(validated)
            }
            Err(reasons) => {
                warn!("Query rejected: {}", reasons.join("; "));
                Err(EngineError::ValidationRejected { reasons })
            }
        }
    }

    fn validate_sql(&self, sql: &str, dialect: Dialect) -> std::result::Result<ValidatedQuery, Vec<String>> {
        let scrubbed = scrub_literals_and_comments(sql);
        let mut reasons = Vec::new();

        let statements = scrubbed.split(';').filter(|s| !s.trim().is_empty()).count();
        if statements == 0 {
            return Err(vec!["Query is empty".to_string()]);
        }
        if statements > 1 {
            reasons.push(format!("Multiple statements are not allowed (found {})", statements));
        }

        for keyword in MUTATING_KEYWORD
            .find_iter(&scrubbed)
            .map(|m| m.as_str().to_uppercase())
            .unique()
        {
            reasons.push(format!("Mutating keyword not allowed: {}", keyword));
        }

        if REPLACE_INTO.is_match(&scrubbed) {
            reasons.push("Mutating keyword not allowed: REPLACE INTO".to_string());
        }

        if !reasons.is_empty() {
            return Err(reasons);
        }

        let parser_dialect: Box<dyn SqlDialect> = match dialect {
            Dialect::RelationalSql => Box::new(PostgreSqlDialect {}),
            _ => Box::new(GenericDialect {}),
        };
        let mut parsed = Parser::parse_sql(parser_dialect.as_ref(), sql)
            .map_err(|e| vec![format!("Query is not well-formed SQL: {}", e)])?;
        if parsed.len() != 1 {
            return Err(vec![format!("Multiple statements are not allowed (found {})", parsed.len())]);
        }

        let mut statement = parsed.remove(0);
        let Statement::Query(query) = &mut statement else {
            return Err(vec!["Only read (SELECT) statements are allowed".to_string()]);
        };
        if let SetExpr::Select(select) = query.body.as_ref() {
            if select.into.is_some() {
                return Err(vec!["SELECT ... INTO creates a table and is not allowed".to_string()]);
            }
        }

        if query.fetch.is_some() {
            return Ok(ValidatedQuery {
                text: sql.trim().trim_end_matches(';').to_string(),
                dialect,
                applied_limit: self.max_rows,
                limit_strategy: LimitStrategy::ClientSide,
            });
        }

        let existing = query.limit.as_ref().map(literal_limit);
        let (applied_limit, strategy) = match existing {
            Some(Some(n)) if n <= self.max_rows => (n, LimitStrategy::Kept),
            Some(_) => (self.max_rows, LimitStrategy::Rewritten),
            None => (self.max_rows, LimitStrategy::Appended),
        };

        let text = if strategy == LimitStrategy::Kept {
            sql.trim().trim_end_matches(';').trim_end().to_string()
        } else {
            query.limit = Some(Expr::Value(SqlValue::Number((applied_limit + 1).to_string(), false)));
            statement.to_string()
        };

        Ok(ValidatedQuery {
            text,
            dialect,
            applied_limit,
            limit_strategy: strategy,
        })
    }

    fn validate_document(&self, text: &str) -> std::result::Result<ValidatedQuery, Vec<String>> {
        let value: Value = serde_json::from_str(text.trim())
            .map_err(|e| vec![format!("Document query is not valid JSON: {}", e)])?;
        let mut reasons = Vec::new();

        let mut object = match value {
            Value::Object(map) => map,
            Value::Array(items) if items.len() > 1 => {
                return Err(vec![format!("Multiple statements are not allowed (found {})", items.len())])
            }
            _ => return Err(vec!["Document query must be a JSON object".to_string()]),
        };

        for key in object.keys() {
            if !DOCUMENT_QUERY_KEYS.contains(&key.as_str()) {
                reasons.push(format!("Unsupported document command: {}", key));
            }
        }
        for stage in find_forbidden_stages(&Value::Object(object.clone())) {
            reasons.push(format!("Write stage not allowed: {}", stage));
        }
        if !matches!(object.get("collection"), Some(Value::String(name)) if !name.is_empty()) {
            reasons.push("Document query must name a collection".to_string());
        }
        if !reasons.is_empty() {
            return Err(reasons);
        }

        let (applied_limit, strategy) = match object.get_mut("pipeline") {
            Some(Value::Array(stages)) => self.limit_pipeline(stages),
            Some(_) => return Err(vec!["pipeline must be an array of stages".to_string()]),
            None => {
                let current = object.get("limit").and_then(Value::as_u64).map(|n| n as usize);
                let (limit, strategy) = match current {
                    Some(n) if n > 0 && n <= self.max_rows => (n, LimitStrategy::Kept),
                    Some(_) => (self.max_rows, LimitStrategy::Rewritten),
                    None => (self.max_rows, LimitStrategy::Appended),
                };
                let fetch = if strategy == LimitStrategy::Kept { limit } else { limit + 1 };
                object.insert("limit".to_string(), json!(fetch));
                (limit, strategy)
            }
        };

        Ok(ValidatedQuery {
            text: Value::Object(object).to_string(),
            dialect: Dialect::Document,
            applied_limit,
            limit_strategy: strategy,
        })
    }

    fn limit_pipeline(&self, stages: &mut Vec<Value>) -> (usize, LimitStrategy) {
        let mut strategy = LimitStrategy::Appended;
        let mut applied = self.max_rows;
        for stage in stages.iter_mut() {
            if let Some(limit) = stage.get_mut("$limit") {
                match limit.as_u64().map(|n| n as usize) {
                    Some(n) if n > 0 && n <= self.max_rows => {
                        if strategy != LimitStrategy::Rewritten {
                            strategy = LimitStrategy::Kept;
                        }
                        applied = applied.min(n);
                    }
                    _ => {
                        *limit = json!(self.max_rows + 1);
                        strategy = LimitStrategy::Rewritten;
                    }
                }
            }
        }
        if strategy == LimitStrategy::Appended {
            stages.push(json!({ "$limit": self.max_rows + 1 }));
        }
        (applied, strategy)
    }
}

fn literal_limit(expr: &Expr) -> Option<usize> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n.parse().ok(),
        _ => None,
    }
}

fn find_forbidden_stages(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                if FORBIDDEN_STAGES.contains(&key.as_str()) {
                    found.push(key.clone());
                }
                found.extend(find_forbidden_stages(inner));
            }
        }
        Value::Array(items) => {
            for item in items {
                found.extend(find_forbidden_stages(item));
            }
        }
        _ => {}
    }
    found
}

/// Blank out string literals, quoted identifiers and comments so keyword and
/// terminator scans only see SQL structure.
pub fn scrub_literals_and_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' | '`' => {
                i += 1;
                while i < chars.len() {
                    if chars[i] == c {
                        // Doubled quote is an escaped quote inside the literal.
                        if chars.get(i + 1) == Some(&c) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                out.push(' ');
                i += 1;
            }
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                out.push(' ');
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                out.push(' ');
                i += 2;
            }
            '$' if next == Some('$') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '$' && chars.get(i + 1) == Some(&'$')) {
                    i += 1;
                }
                out.push(' ');
                i += 2;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sql(text: &str) -> GeneratedQuery {
        GeneratedQuery::new(Uuid::new_v4(), 1, Dialect::RelationalSql, text, "", 0.9)
    }

    fn doc(text: &str) -> GeneratedQuery {
        GeneratedQuery::new(Uuid::new_v4(), 1, Dialect::Document, text, "", 0.9)
    }

    fn reasons(result: Result<ValidatedQuery>) -> Vec<String> {
        match result {
            Err(EngineError::ValidationRejected { reasons }) => reasons,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_every_mutating_keyword() {
        let validator = SafetyValidator::new(100);
        for text in [
            "INSERT INTO t VALUES (1)",
            "UPDATE t SET a = 1",
            "DELETE FROM t",
            "DROP TABLE t",
            "ALTER TABLE t ADD COLUMN b int",
            "TRUNCATE t",
            "CREATE TABLE t (a int)",
            "WITH gone AS (DELETE FROM t RETURNING *) SELECT * FROM gone",
            "GRANT SELECT ON t TO bob",
            "REPLACE INTO t VALUES (1)",
        ] {
            assert!(validator.validate(&sql(text)).is_err(), "{} should be rejected", text);
        }
    }

    #[test]
    fn test_drop_then_select_cites_both_reasons() {
        let validator = SafetyValidator::new(100);
        let reasons = reasons(validator.validate(&sql("DROP TABLE users; SELECT 1")));
        assert!(reasons.iter().any(|r| r.contains("Multiple statements")));
        assert!(reasons.iter().any(|r| r.contains("DROP")));
    }

    #[test]
    fn test_two_selects_rejected() {
        let validator = SafetyValidator::new(100);
        let reasons = reasons(validator.validate(&sql("SELECT 1; SELECT 2;")));
        assert_eq!(reasons, vec!["Multiple statements are not allowed (found 2)".to_string()]);
    }

    #[test]
    fn test_keywords_inside_literals_and_identifiers_pass() {
        let validator = SafetyValidator::new(100);
        let ok = validator
            .validate(&sql(
                "SELECT created_at, \"update\" FROM audit WHERE note = 'drop; delete' -- insert\nLIMIT 5",
            ))
            .unwrap();
        assert_eq!(ok.applied_limit, 5);
        assert_eq!(ok.limit_strategy, LimitStrategy::Kept);
        assert_eq!(ok.fetch_limit(), 5);
    }

    #[test]
    fn test_malformed_and_non_read_rejected() {
        let validator = SafetyValidator::new(100);
        let r = reasons(validator.validate(&sql("SELEC name FROM t")));
        assert!(r[0].contains("not well-formed"));
        let r = reasons(validator.validate(&sql("SHOW search_path")));
        assert!(r[0].contains("Only read"));
        let r = reasons(validator.validate(&sql("SELECT * INTO backup FROM t")));
        assert!(r[0].contains("INTO"));
        let r = reasons(validator.validate(&sql("   ")));
        assert_eq!(r, vec!["Query is empty".to_string()]);
    }

    #[test]
    fn test_limit_appended_and_clamped() {
        let validator = SafetyValidator::new(1000);
        let appended = validator.validate(&sql("SELECT region FROM orders;")).unwrap();
        assert_eq!(appended.limit_strategy, LimitStrategy::Appended);
        assert_eq!(appended.applied_limit, 1000);
        assert_eq!(appended.fetch_limit(), 1001);
        assert!(appended.text.ends_with("LIMIT 1001"));

        let clamped = validator.validate(&sql("SELECT region FROM orders LIMIT 50000")).unwrap();
        assert_eq!(clamped.limit_strategy, LimitStrategy::Rewritten);
        assert_eq!(clamped.applied_limit, 1000);
        assert!(clamped.text.ends_with("LIMIT 1001"));
        assert!(!clamped.text.contains("50000"));
    }

    #[test]
    fn test_document_queries() {
        let validator = SafetyValidator::new(200);
        let ok = validator.validate(&doc(r#"{"collection":"orders","filter":{"status":"paid"}}"#)).unwrap();
        assert_eq!(ok.limit_strategy, LimitStrategy::Appended);
        let parsed: Value = serde_json::from_str(&ok.text).unwrap();
        assert_eq!(parsed["limit"], json!(201));
        assert_eq!(ok.applied_limit, 200);

        let piped = validator
            .validate(&doc(r#"{"collection":"orders","pipeline":[{"$group":{"_id":"$region"}}]}"#))
            .unwrap();
        let parsed: Value = serde_json::from_str(&piped.text).unwrap();
        assert_eq!(parsed["pipeline"][1], json!({"$limit": 201}));

        let r = reasons(validator.validate(&doc(
            r#"{"collection":"orders","pipeline":[{"$match":{}},{"$out":"copy"}]}"#,
        )));
        assert!(r.iter().any(|r| r.contains("$out")));
        let r = reasons(validator.validate(&doc(r#"{"collection":"orders","delete":{}}"#)));
        assert!(r.iter().any(|r| r.contains("delete")));
    }
}
