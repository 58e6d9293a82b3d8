pub mod context;
pub mod error;
pub mod llm;
pub mod parser;
pub mod prompt;
pub mod provider;
pub mod retry;

pub use context::{AccountSummary, PositionContext, ProposalBatch, ProposalRequest};
pub use error::{ProposalError, ProposalResult};
pub use llm::{LlmClient, LlmConfig};
pub use parser::{parse_reply, ParsedReply};
pub use provider::{LlmProposalSource, ProposalSource};
pub use retry::RetryPolicy;
