//! External collaborators
//!
//! The agent executor (ACT) and outcome evaluator (REFLECT) live outside the
//! engine; the control loop only sees these traits.

use async_trait::async_trait;
use remem_common::{AgentId, TaskInput, TierId};
use serde::{Deserialize, Serialize};

/// Task plus THINK augmentation, handed to the executing agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_id: AgentId,
    pub tier_id: TierId,
    pub task: TaskInput,
    /// Rendered prior-experience block; empty when nothing was retrieved
    pub augmentation: String,
}

impl AgentRequest {
    /// Task text followed by the augmentation block
    pub fn augmented_prompt(&self) -> String {
        if self.augmentation.is_empty() {
            self.task.text.clone()
        } else {
            format!("{}\n\n{}", self.task.text, self.augmentation)
        }
    }
}

/// Raw agent output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: String,
    /// Short descriptor of the approach taken
    pub strategy: String,
}

/// REFLECT verdict
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub success: bool,
    /// Continuous quality estimate, nominally in [0, 1]
    pub quality: f64,
}

impl Evaluation {
    /// Verdict used when the evaluator cannot answer
    pub fn unavailable() -> Self {
        Self {
            success: false,
            quality: 0.0,
        }
    }
}

/// Collaborator faults
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Collaborator failed: {0}")]
    Failed(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

/// ACT phase: runs the augmented request on an agent
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentResponse, CollaboratorError>;
}

/// REFLECT phase: judges an agent response
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutcomeEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        request: &AgentRequest,
        response: &AgentResponse,
    ) -> Result<Evaluation, CollaboratorError>;
}
