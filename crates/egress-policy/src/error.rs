use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy body is not valid UTF-8")]
    NotUtf8,

    #[error("invalid policy JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid action '{0}' (expected 'allow' or 'deny')")]
    InvalidAction(String),

    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    #[error("conflicting actions for target '{0}'")]
    InvalidActionCombo(String),
}
