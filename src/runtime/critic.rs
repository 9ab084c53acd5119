//! Critic - two-phase DAG validation
//!
//! Phase 1 runs the deterministic structural suite; critically broken DAGs
//! short-circuit with synthesized feedback and never reach the model.
//! Phase 2 reviews layer by layer at temperature 0, seeing upstream layers
//! only as approved signatures and the current layer in full.
//!
//! Transport failure during a semantic review approves the layer after
//! retries: infrastructure trouble must not penalize a possibly-correct
//! DAG, and sandbox execution remains the final check. The provisional
//! approval is recorded in the layer's issues so feedback history can tell
//! the two cases apart.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ProbeConfig;
use crate::dag::{extract_layers, run_all_structural_validations};
use crate::dataset::{Dataset, Metadata};
use crate::llm::{call_structured, ChatRequest, LlmClient, RetryPolicy};
use crate::model::{CriticFeedback, DagNode, GeneratedDag, LayerValidation, Question};

use super::prompts;

#[derive(Debug, Deserialize)]
struct LayerReview {
    #[serde(default)]
    is_valid: Option<bool>,
    #[serde(default)]
    node_assessments: BTreeMap<String, NodeAssessment>,
    #[serde(default)]
    issues: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NodeAssessment {
    #[serde(default = "default_true")]
    is_correct: bool,
    #[serde(default)]
    issues: Vec<String>,
}

fn default_true() -> bool {
    true
}

pub struct Critic {
    llm: Arc<dyn LlmClient>,
    config: ProbeConfig,
    retry: RetryPolicy,
}

impl Critic {
    pub fn new(llm: Arc<dyn LlmClient>, config: ProbeConfig, retry: RetryPolicy) -> Self {
        Self { llm, config, retry }
    }

    /// Full two-phase review of one DAG.
    pub async fn review(
        &self,
        question: &Question,
        dag: &GeneratedDag,
        dataset: &Dataset,
        metadata: &Metadata,
    ) -> CriticFeedback {
        // ── Phase 1: structural (deterministic) ───────────────────────
        let structural = run_all_structural_validations(dag, dataset);

        if structural.critical {
            info!(question_id = %question.id, errors = structural.errors.len(), "critically broken DAG");
            return CriticFeedback {
                is_approved: false,
                overall_reasoning: format!(
                    "DAG has critical structural errors and cannot be reviewed further. Errors: {}",
                    structural.errors.join("; ")
                ),
                layer_validations: vec![],
                specific_errors: structural.errors,
                suggestions: vec![
                    "Ensure the DAG has at least one node".to_string(),
                    "Ensure final_answer_node references an existing node".to_string(),
                    "Ensure there are no cycles in the DAG".to_string(),
                    "Ensure every node's code parses as one function definition".to_string(),
                ],
            };
        }

        // ── Phase 2: semantic (per-layer LLM) ─────────────────────────
        let mut all_issues = structural.errors.clone();
        let mut layer_validations = Vec::new();

        for (layer_idx, layer_nodes) in extract_layers(dag).into_iter().enumerate() {
            if layer_nodes.is_empty() {
                continue;
            }
            let layer_idx = layer_idx as u32;
            let validation = self
                .review_layer(question, dag, layer_idx, &layer_nodes, dataset, metadata)
                .await;
            if !validation.is_valid {
                all_issues.extend(validation.issues.iter().cloned());
            }
            layer_validations.push(validation);
        }

        let is_approved = all_issues.is_empty();
        let overall_reasoning = if is_approved {
            "DAG is valid and approved for execution.".to_string()
        } else {
            format!("DAG has {} issue(s) that need to be fixed.", all_issues.len())
        };

        let mut suggestions = Vec::new();
        if !structural.errors.is_empty() {
            suggestions
                .push("Fix structural issues first (layers, edges, references)".to_string());
        }
        if layer_validations.iter().any(|lv| !lv.is_valid) {
            suggestions.push("Review and fix the code logic in flagged nodes".to_string());
            suggestions.push("Ensure type compatibility between connected nodes".to_string());
        }

        info!(
            question_id = %question.id,
            approved = is_approved,
            issues = all_issues.len(),
            "critic verdict"
        );

        CriticFeedback {
            is_approved,
            overall_reasoning,
            layer_validations,
            specific_errors: all_issues,
            suggestions,
        }
    }

    async fn review_layer(
        &self,
        question: &Question,
        dag: &GeneratedDag,
        layer_index: u32,
        layer_nodes: &[&DagNode],
        dataset: &Dataset,
        metadata: &Metadata,
    ) -> LayerValidation {
        let node_ids: Vec<String> = layer_nodes.iter().map(|n| n.node_id.clone()).collect();
        let validated_summary = prompts::build_validated_layers_summary(dag, layer_index);
        let request = ChatRequest::new(
            prompts::CRITIC_SYSTEM,
            prompts::build_critic_layer_prompt(
                question,
                dag,
                layer_index,
                layer_nodes,
                &validated_summary,
                dataset,
                metadata,
            ),
            self.config.critic_temperature,
        );

        match call_structured::<LayerReview>(self.llm.as_ref(), &request, &self.retry).await {
            Ok(review) => {
                let mut issues = Vec::new();
                for (node_id, assessment) in &review.node_assessments {
                    if !assessment.is_correct {
                        for issue in &assessment.issues {
                            issues.push(format!("{node_id}: {issue}"));
                        }
                        if assessment.issues.is_empty() {
                            issues.push(format!("{node_id}: flagged as incorrect"));
                        }
                    }
                }
                issues.extend(review.issues.iter().cloned());
                let is_valid = review.is_valid.unwrap_or(issues.is_empty()) && issues.is_empty();
                LayerValidation {
                    layer_index,
                    nodes_in_layer: node_ids,
                    is_valid,
                    issues,
                }
            }
            Err(e) => {
                // Infrastructure failure, not a model-under-test failure.
                warn!(
                    question_id = %question.id,
                    layer = layer_index,
                    error = %e,
                    "semantic review unavailable; approving layer provisionally"
                );
                LayerValidation {
                    layer_index,
                    nodes_in_layer: node_ids,
                    is_valid: true,
                    issues: vec![format!(
                        "semantic review unavailable ({e}); layer approved provisionally — \
sandbox execution is the final check"
                    )],
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;
    use crate::model::{DagEdge, DifficultyLevel};
    use serde_json::json;

    fn question() -> Question {
        Question {
            id: "q_01".into(),
            text: "What is total?".into(),
            difficulty_rank: 1,
            difficulty_level: DifficultyLevel::Easy,
            reasoning: String::new(),
            relevant_data_keys: vec![],
        }
    }

    fn dataset() -> Dataset {
        json!({"total": 42}).as_object().unwrap().clone()
    }

    fn critic(mock: Arc<MockClient>) -> Critic {
        Critic::new(mock, ProbeConfig::default(), RetryPolicy::fast_for_tests())
    }

    fn node(id: &str, layer: u32, input: &str) -> DagNode {
        DagNode {
            node_id: id.into(),
            operation: "op".into(),
            function_name: "f".into(),
            inputs: BTreeMap::from([("x".to_string(), input.to_string())]),
            expected_output_type: "int".into(),
            layer,
            code: "def f(x): return x".into(),
        }
    }

    fn valid_one_node_dag() -> GeneratedDag {
        GeneratedDag {
            question_id: "q_01".into(),
            description: "identity".into(),
            nodes: vec![node("a", 0, "dataset.total")],
            edges: vec![],
            final_answer_node: "a".into(),
        }
    }

    fn approve_reply() -> serde_json::Value {
        json!({"is_valid": true, "node_assessments": {}, "issues": []})
    }

    // ═══════════════════════════════════════════════════════════════
    // Phase 1 short-circuit
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn empty_dag_rejected_without_llm_call() {
        let mock = Arc::new(MockClient::new());
        let dag = GeneratedDag::empty("q_01", "fallback");
        let feedback = critic(mock.clone())
            .review(&question(), &dag, &dataset(), &Metadata::default())
            .await;
        assert!(!feedback.is_approved);
        assert!(feedback.overall_reasoning.contains("critical structural errors"));
        assert!(feedback
            .specific_errors
            .iter()
            .any(|e| e.contains("no nodes")));
        // no semantic phase happened
        assert_eq!(mock.call_count(), 0);
        assert!(feedback.layer_validations.is_empty());
    }

    #[tokio::test]
    async fn cyclic_dag_rejected_without_llm_call() {
        let mock = Arc::new(MockClient::new());
        let dag = GeneratedDag {
            question_id: "q_01".into(),
            description: String::new(),
            nodes: vec![node("a", 0, "dataset.total"), node("b", 1, "prev_node.a.output")],
            edges: vec![
                DagEdge {
                    source: "a".into(),
                    target: "b".into(),
                },
                DagEdge {
                    source: "b".into(),
                    target: "a".into(),
                },
            ],
            final_answer_node: "b".into(),
        };
        let feedback = critic(mock.clone())
            .review(&question(), &dag, &dataset(), &Metadata::default())
            .await;
        assert!(!feedback.is_approved);
        assert!(feedback.specific_errors.iter().any(|e| e.contains("cycle")));
        assert_eq!(mock.call_count(), 0);
    }

    // ═══════════════════════════════════════════════════════════════
    // Phase 2 verdicts
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn clean_dag_with_clean_review_is_approved() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(approve_reply());
        let feedback = critic(mock.clone())
            .review(&question(), &valid_one_node_dag(), &dataset(), &Metadata::default())
            .await;
        assert!(feedback.is_approved, "{:?}", feedback.specific_errors);
        assert_eq!(feedback.layer_validations.len(), 1);
        assert!(feedback.layer_validations[0].is_valid);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn semantic_issues_reject_with_node_context() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(json!({
            "is_valid": false,
            "node_assessments": {
                "a": {"is_correct": false,
                       "issues": ["accesses key 'totl' which is not in the schema"]}
            },
            "issues": []
        }));
        let feedback = critic(mock)
            .review(&question(), &valid_one_node_dag(), &dataset(), &Metadata::default())
            .await;
        assert!(!feedback.is_approved);
        assert!(feedback
            .specific_errors
            .iter()
            .any(|e| e.contains("a:") && e.contains("totl")));
        assert!(feedback
            .suggestions
            .iter()
            .any(|s| s.contains("code logic")));
    }

    #[tokio::test]
    async fn structural_errors_block_approval_even_if_semantics_pass() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(approve_reply());
        // non-critical structural problem: input references a missing key
        let mut dag = valid_one_node_dag();
        dag.nodes[0]
            .inputs
            .insert("x".to_string(), "dataset.ghost".to_string());
        let feedback = critic(mock)
            .review(&question(), &dag, &dataset(), &Metadata::default())
            .await;
        assert!(!feedback.is_approved);
        assert!(feedback.specific_errors.iter().any(|e| e.contains("ghost")));
    }

    #[tokio::test]
    async fn transport_failure_approves_layer_provisionally() {
        let mock = Arc::new(MockClient::new());
        for _ in 0..3 {
            mock.push_transport_failure("503");
        }
        let feedback = critic(mock)
            .review(&question(), &valid_one_node_dag(), &dataset(), &Metadata::default())
            .await;
        // approved: infrastructure failure must not penalize the DAG
        assert!(feedback.is_approved);
        let lv = &feedback.layer_validations[0];
        assert!(lv.is_valid);
        // but the provisional approval is visible in the history
        assert!(lv.issues.iter().any(|i| i.contains("provisionally")));
    }

    #[tokio::test]
    async fn layers_reviewed_in_order_with_one_call_each() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(approve_reply());
        mock.push_json(approve_reply());
        let dag = GeneratedDag {
            question_id: "q_01".into(),
            description: String::new(),
            nodes: vec![node("a", 0, "dataset.total"), node("b", 1, "prev_node.a.output")],
            edges: vec![DagEdge {
                source: "a".into(),
                target: "b".into(),
            }],
            final_answer_node: "b".into(),
        };
        let feedback = critic(mock.clone())
            .review(&question(), &dag, &dataset(), &Metadata::default())
            .await;
        assert!(feedback.is_approved);
        assert_eq!(mock.call_count(), 2);
        assert_eq!(feedback.layer_validations[0].layer_index, 0);
        assert_eq!(feedback.layer_validations[1].layer_index, 1);
        // second call sees layer 0 as a signature summary
        let second_prompt = &mock.calls()[1].user;
        assert!(second_prompt.contains("Already-Validated Upstream Layers"));
    }
}
