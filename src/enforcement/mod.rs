pub mod engine;
pub mod submitter;

pub use engine::EnforcementEngine;
pub use submitter::{ContractSubmitter, RestrictionSubmitter};
