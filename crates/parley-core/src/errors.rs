/// Failures of the auth collaborator. All of them reject the request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
}

impl AuthError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::InvalidToken(_) => "invalid_token",
            Self::Expired => "expired",
        }
    }
}

/// Failures of the chat-management collaborator.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// An inbound frame that could not be parsed, or an outbound event that
/// could not be serialized.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The hub loop has stopped and no longer accepts events.
    #[error("hub is closed")]
    Closed,
}
