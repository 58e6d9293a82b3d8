use async_trait::async_trait;

use crate::context::{ProposalBatch, ProposalRequest};
use crate::error::{ProposalError, ProposalResult};
use crate::llm::LlmClient;
use crate::parser::parse_reply;
use crate::prompt::{build_system_prompt, build_user_prompt};
use crate::retry::RetryPolicy;

/// Anything that can turn account and market context into decision proposals.
#[async_trait]
pub trait ProposalSource: Send + Sync {
    async fn get_proposals(&self, request: &ProposalRequest) -> ProposalResult<ProposalBatch>;

    fn source_name(&self) -> &str;
}

/// Chat-completions backed source: prompt, call with retries, parse.
pub struct LlmProposalSource {
    client: LlmClient,
    retry: RetryPolicy,
}

impl LlmProposalSource {
    pub fn new(client: LlmClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

impl From<LlmClient> for LlmProposalSource {
    fn from(client: LlmClient) -> Self {
        Self::new(client, RetryPolicy::default())
    }
}

#[async_trait]
impl ProposalSource for LlmProposalSource {
    async fn get_proposals(&self, request: &ProposalRequest) -> ProposalResult<ProposalBatch> {
        let system_prompt = build_system_prompt(request);
        let user_prompt = build_user_prompt(request);

        let reply = self
            .retry
            .run("proposal request", |_| self.client.chat(&system_prompt, &user_prompt))
            .await?;

        tracing::debug!("Proposal reply ({} chars) from {}", reply.len(), self.client.model());

        let parsed = parse_reply(&reply).inspect_err(|e| {
            if let ProposalError::Parse { message, .. } = e {
                tracing::warn!("Could not parse proposal reply: {}", message);
            }
        })?;

        tracing::info!(
            "Received {} proposed decisions from {}",
            parsed.intents.len(),
            self.client.model()
        );

        Ok(ProposalBatch {
            system_prompt,
            user_prompt,
            rationale: parsed.rationale,
            intents: parsed.intents,
        })
    }

    fn source_name(&self) -> &str {
        self.client.model()
    }
}
