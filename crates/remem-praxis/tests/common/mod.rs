//! Shared harness for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use remem_common::{Experience, TaskInput};
use remem_praxis::config::RememConfig;
use remem_praxis::{
    AgentExecutor, AgentRequest, AgentResponse, CollaboratorError, Evaluation, OutcomeEvaluator,
    RememService,
};

pub const DIM: usize = 32;

pub fn config(capacity: usize) -> RememConfig {
    let mut config = RememConfig::default();
    config.store.dimension = DIM;
    config.store.capacity = capacity;
    config
}

pub fn service(capacity: usize) -> Arc<RememService> {
    Arc::new(RememService::new(config(capacity)).unwrap())
}

pub fn random_embedding(rng: &mut StdRng) -> Vec<f32> {
    (0..DIM).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

pub fn experience(
    agent: &str,
    tier: &str,
    task: &str,
    embedding: Vec<f32>,
    fitness: f32,
) -> Experience {
    Experience::builder(agent, tier)
        .task(TaskInput::new(task))
        .output(format!("output for {}", task))
        .strategy("baseline")
        .embedding(embedding)
        .fitness(fitness)
        .build()
        .unwrap()
}

/// Echoes the task back
pub struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentResponse, CollaboratorError> {
        Ok(AgentResponse {
            output: format!("done: {}", request.task.text),
            strategy: if request.augmentation.is_empty() {
                "fresh".into()
            } else {
                "recalled".into()
            },
        })
    }
}

/// Fixed verdict
pub struct FixedEvaluator {
    pub success: bool,
    pub quality: f64,
}

#[async_trait]
impl OutcomeEvaluator for FixedEvaluator {
    async fn evaluate(
        &self,
        _request: &AgentRequest,
        _response: &AgentResponse,
    ) -> Result<Evaluation, CollaboratorError> {
        Ok(Evaluation {
            success: self.success,
            quality: self.quality,
        })
    }
}

pub fn collaborators(
    success: bool,
    quality: f64,
) -> (Arc<dyn AgentExecutor>, Arc<dyn OutcomeEvaluator>) {
    (
        Arc::new(EchoExecutor),
        Arc::new(FixedEvaluator { success, quality }),
    )
}
