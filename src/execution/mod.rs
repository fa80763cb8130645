//! Query execution against connected data sources.

pub mod executor;
pub mod result;

pub use executor::Executor;
pub use result::ExecutionResult;
