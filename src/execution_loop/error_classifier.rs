//! Error Classifier
//!
//! Maps connector failures onto the recoverable-failure taxonomy that drives
//! the healing loop.

use crate::connectors::ConnectorError;
use crate::error::FailureKind;

/// Error classifier
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Structured kinds from the connector win; the message is only consulted
    /// when the backend gave no code.
    pub fn classify(&self, error: &ConnectorError) -> FailureKind {
        match error {
            ConnectorError::Execution { kind, reason } => {
                if *kind != FailureKind::Other {
                    *kind
                } else {
                    self.classify_message(reason)
                }
            }
            _ => FailureKind::Other,
        }
    }

    pub fn classify_message(&self, message: &str) -> FailureKind {
        let error_msg = message.to_lowercase();

        if error_msg.contains("ambiguous") && error_msg.contains("column") {
            return FailureKind::AmbiguousColumn;
        }

        if error_msg.contains("column")
            && (error_msg.contains("not found")
                || error_msg.contains("does not exist")
                || error_msg.contains("cannot be resolved")
                || error_msg.contains("unable to find")
                || error_msg.contains("no column"))
        {
            return FailureKind::UnknownColumn;
        }

        if (error_msg.contains("table") || error_msg.contains("relation") || error_msg.contains("collection"))
            && (error_msg.contains("not found") || error_msg.contains("does not exist"))
        {
            return FailureKind::UnknownTable;
        }

        if error_msg.contains("permission denied") || error_msg.contains("access denied") || error_msg.contains("not authorized") {
            return FailureKind::Permission;
        }

        if error_msg.contains("join") && (error_msg.contains("condition") || error_msg.contains("invalid") || error_msg.contains("missing")) {
            return FailureKind::JoinFailure;
        }

        if error_msg.contains("group by") || error_msg.contains("aggregate") || error_msg.contains("aggregation") {
            return FailureKind::InvalidAggregation;
        }

        if error_msg.contains("syntax error") || error_msg.contains("mismatched input") || error_msg.contains("parse error") {
            return FailureKind::Syntax;
        }

        FailureKind::Other
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
