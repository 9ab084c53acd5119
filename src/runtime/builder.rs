//! DAG builder - LLM call producing one DAG per question iteration
//!
//! First iteration builds from the schema alone; retries also carry the
//! previous DAG and the critic's feedback with a complete-replacement
//! instruction. This function never fails: after retry exhaustion it
//! returns an empty DAG for the critic to reject cleanly instead of
//! crashing the loop.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ProbeConfig;
use crate::dataset::{Dataset, Metadata};
use crate::llm::{call_structured, ChatRequest, LlmClient, RetryPolicy};
use crate::model::{CriticFeedback, DagEdge, DagNode, GeneratedDag, Question};

use super::prompts;

#[derive(Debug, Deserialize)]
struct DagResponse {
    #[serde(default)]
    description: String,
    #[serde(default)]
    nodes: Vec<DagNode>,
    #[serde(default)]
    edges: Vec<DagEdge>,
    #[serde(default)]
    final_answer_node: String,
}

pub struct DagBuilder {
    llm: Arc<dyn LlmClient>,
    config: ProbeConfig,
    retry: RetryPolicy,
}

impl DagBuilder {
    pub fn new(llm: Arc<dyn LlmClient>, config: ProbeConfig, retry: RetryPolicy) -> Self {
        Self { llm, config, retry }
    }

    /// Generate (or regenerate) a DAG for the question.
    pub async fn build(
        &self,
        question: &Question,
        dataset: &Dataset,
        metadata: &Metadata,
        prior: Option<(&GeneratedDag, &CriticFeedback)>,
    ) -> GeneratedDag {
        let request = ChatRequest::new(
            prompts::DAG_GEN_SYSTEM,
            prompts::build_dag_prompt(question, dataset, metadata, prior),
            self.config.builder_temperature,
        );

        match call_structured::<DagResponse>(self.llm.as_ref(), &request, &self.retry).await {
            Ok(response) => {
                let dag = GeneratedDag {
                    question_id: question.id.clone(),
                    description: response.description,
                    nodes: response.nodes,
                    edges: response.edges,
                    final_answer_node: response.final_answer_node,
                };
                info!(
                    question_id = %question.id,
                    nodes = dag.nodes.len(),
                    edges = dag.edges.len(),
                    regenerated = prior.is_some(),
                    "DAG built"
                );
                dag
            }
            Err(e) => {
                warn!(question_id = %question.id, error = %e, "DAG generation failed; returning empty DAG");
                GeneratedDag::empty(&question.id, format!("Generation failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;
    use crate::model::DifficultyLevel;
    use serde_json::json;

    fn question() -> Question {
        Question {
            id: "q_01".into(),
            text: "What is total?".into(),
            difficulty_rank: 1,
            difficulty_level: DifficultyLevel::Easy,
            reasoning: String::new(),
            relevant_data_keys: vec!["total".into()],
        }
    }

    fn dataset() -> Dataset {
        json!({"total": 42}).as_object().unwrap().clone()
    }

    fn builder(mock: Arc<MockClient>) -> DagBuilder {
        DagBuilder::new(mock, ProbeConfig::default(), RetryPolicy::fast_for_tests())
    }

    fn one_node_reply() -> serde_json::Value {
        json!({
            "question_id": "q_01",
            "description": "return the total",
            "nodes": [{
                "node_id": "a",
                "operation": "identity",
                "function_name": "ret",
                "inputs": {"x": "dataset.total"},
                "expected_output_type": "int",
                "layer": 0,
                "code": "def ret(x): return x"
            }],
            "edges": [],
            "final_answer_node": "a"
        })
    }

    #[tokio::test]
    async fn parses_dag_response() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(one_node_reply());
        let dag = builder(mock.clone())
            .build(&question(), &dataset(), &Metadata::default(), None)
            .await;
        assert_eq!(dag.question_id, "q_01");
        assert_eq!(dag.nodes.len(), 1);
        assert_eq!(dag.final_answer_node, "a");
        // first iteration: prompt carries no feedback section
        assert!(!mock.calls()[0].user.contains("PREVIOUS ATTEMPT"));
    }

    #[tokio::test]
    async fn retry_prompt_carries_feedback() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(one_node_reply());
        let prev = GeneratedDag::empty("q_01", "first");
        let feedback = CriticFeedback {
            is_approved: false,
            overall_reasoning: "cycle detected".into(),
            layer_validations: vec![],
            specific_errors: vec!["DAG contains a cycle: a → b → a".into()],
            suggestions: vec![],
        };
        builder(mock.clone())
            .build(
                &question(),
                &dataset(),
                &Metadata::default(),
                Some((&prev, &feedback)),
            )
            .await;
        let prompt = &mock.calls()[0].user;
        assert!(prompt.contains("PREVIOUS ATTEMPT REJECTED"));
        assert!(prompt.contains("cycle detected"));
    }

    #[tokio::test]
    async fn exhaustion_returns_empty_dag() {
        let mock = Arc::new(MockClient::new());
        for _ in 0..3 {
            mock.push_transport_failure("timeout");
        }
        let dag = builder(mock)
            .build(&question(), &dataset(), &Metadata::default(), None)
            .await;
        assert!(dag.nodes.is_empty());
        assert!(dag.description.contains("Generation failed"));
    }

    #[tokio::test]
    async fn malformed_json_retries_then_succeeds() {
        let mock = Arc::new(MockClient::new());
        mock.push_raw("{not json");
        mock.push_json(one_node_reply());
        let dag = builder(mock.clone())
            .build(&question(), &dataset(), &Metadata::default(), None)
            .await;
        assert_eq!(dag.nodes.len(), 1);
        assert_eq!(mock.call_count(), 2);
    }
}
