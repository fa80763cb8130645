pub mod error_classifier;
pub mod healing;

pub use error_classifier::ErrorClassifier;
pub use healing::{HealingLoop, HealingOutcome, HealingStages, RequestState};
