use thiserror::Error;

/// Substrings of transport errors that are worth another attempt.
const RETRYABLE_MESSAGES: [&str; 6] = [
    "EOF",
    "timeout",
    "connection reset",
    "connection refused",
    "temporary failure",
    "no such host",
];

#[derive(Error, Debug)]
pub enum ProposalError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Proposal service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Proposal service returned an empty reply")]
    EmptyResponse,

    #[error("Failed to parse decisions: {message}")]
    Parse { message: String, rationale: String },

    #[error("API key is not configured")]
    MissingApiKey,

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ProposalError>,
    },
}

pub type ProposalResult<T> = Result<T, ProposalError>;

impl ProposalError {
    /// Network-level failures that may succeed on a later attempt.
    /// Authentication, parse and contract errors never are.
    pub fn is_transient(&self) -> bool {
        match self {
            ProposalError::Timeout => true,
            ProposalError::RequestFailed(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                let message = e.to_string();
                RETRYABLE_MESSAGES.iter().any(|m| message.contains(m))
            }
            ProposalError::Status { status, .. } => *status == 429 || *status >= 500,
            ProposalError::InvalidResponse(_)
            | ProposalError::EmptyResponse
            | ProposalError::Parse { .. }
            | ProposalError::MissingApiKey
            | ProposalError::RetriesExhausted { .. } => false,
        }
    }

    /// Reasoning text recovered before the failure, if any.
    pub fn rationale(&self) -> Option<&str> {
        match self {
            ProposalError::Parse { rationale, .. } if !rationale.is_empty() => Some(rationale),
            ProposalError::RetriesExhausted { last, .. } => last.rationale(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProposalError::Timeout.is_transient());
        assert!(ProposalError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(ProposalError::Status {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!ProposalError::Status {
            status: 401,
            body: "invalid api key".into()
        }
        .is_transient());
        assert!(!ProposalError::MissingApiKey.is_transient());
        assert!(!ProposalError::EmptyResponse.is_transient());
    }

    #[test]
    fn test_rationale_survives_retry_wrapper() {
        let err = ProposalError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ProposalError::Parse {
                message: "no array".into(),
                rationale: "BTC looks weak".into(),
            }),
        };
        assert_eq!(err.rationale(), Some("BTC looks weak"));
        assert_eq!(ProposalError::Timeout.rationale(), None);
    }
}
