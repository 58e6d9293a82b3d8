pub mod models;
pub mod sequencer;
pub mod validator;

pub use models::{Action, DecisionIntent, ProposedIntent};
pub use sequencer::sequence;
pub use validator::{AssetClass, DecisionValidator, ValidationError, ValidatorConfig};
