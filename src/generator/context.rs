//! Query Context
//!
//! Everything one generation call needs: the question, bounded conversation
//! history, the schema snapshot, and an optional semantic table subset.
//!
//! History policy: at construction only the newest `max_turns` turns are
//! kept (oldest dropped first). When rendering into a prompt, turns are
//! admitted newest-first until the character budget is spent, then emitted
//! in chronological order.

use crate::connectors::Dialect;
use crate::schema::SchemaSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub query: String,
    pub answer_summary: String,
}

impl ConversationTurn {
    pub fn new(
        question: impl Into<String>,
        query: impl Into<String>,
        answer_summary: impl Into<String>,
    ) -> Self {
        Self {
            question: question.into(),
            query: query.into(),
            answer_summary: answer_summary.into(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "Q: {}\nQuery: {}\nAnswer: {}\n",
            self.question, self.query, self.answer_summary
        )
    }
}

#[derive(Debug, Clone)]
pub struct QueryContext {
    question: String,
    history: Vec<ConversationTurn>,
    schema: Arc<SchemaSnapshot>,
    dialect: Dialect,
    focus_tables: Option<Vec<String>>,
}

impl QueryContext {
    /// `history` is chronological (oldest first).
    pub fn new(
        question: impl Into<String>,
        mut history: Vec<ConversationTurn>,
        schema: Arc<SchemaSnapshot>,
        dialect: Dialect,
        max_turns: usize,
    ) -> Self {
        if history.len() > max_turns {
            let excess = history.len() - max_turns;
            history.drain(..excess);
        }
        Self {
            question: question.into(),
            history,
            schema,
            dialect,
            focus_tables: None,
        }
    }

    pub fn with_focus_tables(mut self, tables: Option<Vec<String>>) -> Self {
        self.focus_tables = tables;
        self
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn schema(&self) -> &Arc<SchemaSnapshot> {
        &self.schema
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn focus_tables(&self) -> Option<&[String]> {
        self.focus_tables.as_deref()
    }

    /// Turns that fit in `char_budget`, most recent given priority, returned oldest first.
    pub fn history_for_prompt(&self, char_budget: usize) -> Vec<&ConversationTurn> {
        let mut used = 0usize;
        let mut kept: Vec<&ConversationTurn> = Vec::new();
        for turn in self.history.iter().rev() {
            let cost = turn.render().len();
            if used + cost > char_budget {
                break;
            }
            used += cost;
            kept.push(turn);
        }
        kept.reverse();
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::RawSchema;

    fn schema() -> Arc<SchemaSnapshot> {
        Arc::new(SchemaSnapshot::build("ds", &RawSchema::default()))
    }

    fn turns(n: usize) -> Vec<ConversationTurn> {
        (0..n)
            .map(|i| ConversationTurn::new(format!("q{}", i), format!("SELECT {}", i), "ok"))
            .collect()
    }

    #[test]
    fn test_history_drops_oldest_first() {
        let ctx = QueryContext::new("now by region", turns(7), schema(), Dialect::RelationalSql, 5);
        let questions: Vec<&str> = ctx.history().iter().map(|t| t.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3", "q4", "q5", "q6"]);
    }

    #[test]
    fn test_prompt_budget_prefers_recent_turns() {
        let ctx = QueryContext::new("next", turns(4), schema(), Dialect::RelationalSql, 10);
        let one_turn = ctx.history()[0].render().len();
        let kept = ctx.history_for_prompt(one_turn * 2);
        let questions: Vec<&str> = kept.iter().map(|t| t.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3"]);
        assert!(ctx.history_for_prompt(0).is_empty());
    }
}
