//! Safety gate for generated queries.

pub mod validator;

pub use validator::{scrub_literals_and_comments, LimitStrategy, SafetyValidator, ValidatedQuery};
