//! Error taxonomy for gateway calls and stage agents.
//!
//! A failing verifier result is not an error. It is a verdict that drives the
//! fix loop (see `core::transition`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::StageName;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The completion service's payload did not match the stage's result schema.
    #[error("{stage} output violated its result schema:\n- {}", .details.join("\n- "))]
    SchemaViolation {
        stage: StageName,
        details: Vec<String>,
    },

    /// The planner answered within schema but without a usable plan.
    #[error("planner returned a malformed plan: {reason}")]
    MalformedPlan { reason: String },

    #[error("{stage} call timed out after {}s", .timeout.as_secs())]
    GatewayTimeout { stage: StageName, timeout: Duration },

    #[error("{stage} transport failure: {message}")]
    GatewayTransport { stage: StageName, message: String },

    #[error("{stage} exhausted its turn budget of {max_turns} turns")]
    TurnBudgetExhausted { stage: StageName, max_turns: u32 },

    #[error("{stage} attempted `{tool}` outside its capability grant")]
    CapabilityViolation { stage: StageName, tool: String },

    #[error("{stage} call was cancelled")]
    Cancelled { stage: StageName },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Serializable classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    SchemaViolation,
    MalformedPlan,
    GatewayTimeout,
    GatewayTransport,
    TurnBudgetExhausted,
    CapabilityViolation,
    Cancelled,
    Internal,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::SchemaViolation { .. } => ErrorClass::SchemaViolation,
            PipelineError::MalformedPlan { .. } => ErrorClass::MalformedPlan,
            PipelineError::GatewayTimeout { .. } => ErrorClass::GatewayTimeout,
            PipelineError::GatewayTransport { .. } => ErrorClass::GatewayTransport,
            PipelineError::TurnBudgetExhausted { .. } => ErrorClass::TurnBudgetExhausted,
            PipelineError::CapabilityViolation { .. } => ErrorClass::CapabilityViolation,
            PipelineError::Cancelled { .. } => ErrorClass::Cancelled,
            PipelineError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Transport failures and timeouts may be re-invoked with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::GatewayTimeout { .. } | PipelineError::GatewayTransport { .. }
        )
    }

    pub fn stage(&self) -> Option<StageName> {
        match self {
            PipelineError::SchemaViolation { stage, .. }
            | PipelineError::GatewayTimeout { stage, .. }
            | PipelineError::GatewayTransport { stage, .. }
            | PipelineError::TurnBudgetExhausted { stage, .. }
            | PipelineError::CapabilityViolation { stage, .. }
            | PipelineError::Cancelled { stage } => Some(*stage),
            PipelineError::MalformedPlan { .. } => Some(StageName::Planner),
            PipelineError::Internal(_) => None,
        }
    }
}
