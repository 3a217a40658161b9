//! Error types for the analysis script orchestrator

use crate::models::FailureKind;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Conversation Errors
    // =============================

    #[error("Model call failed: {0}")]
    ModelCall(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Disallowed functions requested: {}", .0.join(", "))]
    DisallowedFunctions(Vec<String>),

    #[error("No structured response found in model output")]
    NoStructuredResponse,

    /// Hard stop: the model keeps submitting scripts that fail validation.
    #[error("Max retries exceeded: {attempts} unsuccessful write-and-validate attempts")]
    MaxRetriesExceeded { attempts: u32 },

    /// Hard stop: verification was required but could not produce a result.
    #[error("Verification unavailable: {0}")]
    VerificationUnavailable(String),

    // =============================
    // Ambient Errors
    // =============================

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Prompt error: {0}")]
    Prompt(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Hard errors end the conversation without a structured response and
    /// must not be retried automatically.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            OrchestrationError::MaxRetriesExceeded { .. }
                | OrchestrationError::VerificationUnavailable(_)
        )
    }

    /// Failure category for errors the driver reports as a terminal value.
    /// `None` for everything that must propagate.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            OrchestrationError::ModelCall(_) => Some(FailureKind::ModelCall),
            OrchestrationError::ToolExecution(_) | OrchestrationError::DisallowedFunctions(_) => {
                Some(FailureKind::ToolExecution)
            }
            OrchestrationError::NoStructuredResponse => Some(FailureKind::NoStructuredResponse),
            _ => None,
        }
    }
}
