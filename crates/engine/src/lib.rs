#![warn(clippy::unwrap_used)]

//! Ad selection and budget enforcement: filter → score/select → charge
//! check → record → respond.

pub mod eligibility;
pub mod ledger;
pub mod orchestrator;
pub mod recorder;
pub mod scorer;

pub use eligibility::{Candidate, EligibilityFilter};
pub use ledger::BudgetLedger;
pub use orchestrator::{
    ClickOutcome, EligibleAd, EngineParts, EngineSettings, ServeOutcome, ServeRequest, ServedAd,
    ServingEngine,
};
pub use recorder::DeliveryRecorder;
pub use scorer::{Scorer, ScoringWeights};
