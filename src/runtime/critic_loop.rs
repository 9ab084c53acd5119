//! Critic loop - the per-question build → critique → execute state machine
//!
//! ```text
//! START ──► BUILD ──► VALIDATE ──┬─ approved ──► EXECUTE ──► DONE
//!             ▲                  ├─ rejected, iterations left ──► BUILD
//!             └──────────────────┘
//!                                └─ rejected, exhausted ──► GIVE_UP ──► DONE
//! ```
//!
//! The loop owns the question's full audit state: every DAG, every piece of
//! feedback, the execution result, and a role-tagged conversation log.
//! Execution failure never triggers a rebuild — it is a test outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ProbeConfig;
use crate::dataset::{Dataset, Metadata};
use crate::event::{EventKind, RunStream};
use crate::llm::{LlmClient, RetryPolicy};
use crate::model::{Question, QuestionTrace, TraceMessage, TraceRole};

use super::builder::DagBuilder;
use super::critic::Critic;
use super::executor::execute_dag;

pub struct CriticLoop {
    builder: DagBuilder,
    critic: Critic,
    config: ProbeConfig,
}

impl CriticLoop {
    pub fn new(llm: Arc<dyn LlmClient>, config: ProbeConfig, retry: RetryPolicy) -> Self {
        Self {
            builder: DagBuilder::new(Arc::clone(&llm), config.clone(), retry.clone()),
            critic: Critic::new(llm, config.clone(), retry),
            config,
        }
    }

    /// Run the full state machine for one question.
    ///
    /// Always returns a trace; a loop that gave up (or was cancelled) has
    /// `execution_result = None`.
    pub async fn run(
        &self,
        question: Question,
        dataset: &Dataset,
        metadata: &Metadata,
        stream: &RunStream,
        cancelled: &AtomicBool,
    ) -> QuestionTrace {
        let mut trace = QuestionTrace {
            question,
            dag_history: Vec::new(),
            feedback_history: Vec::new(),
            execution_result: None,
            total_iterations: 0,
            conversation: Vec::new(),
        };
        let question_id = trace.question.id.clone();

        loop {
            if cancelled.load(Ordering::SeqCst) {
                warn!(question_id, "cancelled; giving up");
                trace.conversation.push(TraceMessage::new(
                    TraceRole::Critic,
                    format!("[Critic] {question_id}: run cancelled — giving up"),
                ));
                break;
            }
            if trace.total_iterations >= self.config.max_iterations {
                info!(
                    question_id,
                    iterations = trace.total_iterations,
                    "critic loop exhausted"
                );
                break;
            }

            // ── BUILD ─────────────────────────────────────────────────
            let prior = trace
                .dag_history
                .last()
                .zip(trace.feedback_history.last());
            let dag = self
                .builder
                .build(&trace.question, dataset, metadata, prior)
                .await;
            trace.total_iterations += 1;
            let iteration = trace.total_iterations;

            trace.conversation.push(TraceMessage::new(
                TraceRole::DagBuilder,
                if dag.nodes.is_empty() {
                    format!(
                        "[DagBuilder] Iteration {iteration} for {question_id}: {}",
                        dag.description
                    )
                } else {
                    format!(
                        "[DagBuilder] Iteration {iteration} for {question_id}: {} DAG with {} nodes",
                        if iteration > 1 { "regenerated" } else { "generated" },
                        dag.nodes.len()
                    )
                },
            ));
            stream.publish(EventKind::DagBuilt {
                question_id: question_id.clone(),
                iteration,
                node_count: dag.nodes.len(),
                edge_count: dag.edges.len(),
            });
            trace.dag_history.push(dag);

            // ── VALIDATE ──────────────────────────────────────────────
            let dag = trace
                .dag_history
                .last()
                .expect("dag pushed just above");
            let feedback = self
                .critic
                .review(&trace.question, dag, dataset, metadata)
                .await;

            let status = if feedback.is_approved {
                "APPROVED"
            } else {
                "REJECTED"
            };
            trace.conversation.push(TraceMessage::new(
                TraceRole::Critic,
                format!(
                    "[Critic] Iteration {iteration} for {question_id}: {status} — {} issue(s)",
                    feedback.specific_errors.len()
                ),
            ));
            stream.publish(EventKind::CriticResult {
                question_id: question_id.clone(),
                iteration,
                is_approved: feedback.is_approved,
                issues_count: feedback.specific_errors.len(),
                overall_reasoning: feedback.overall_reasoning.clone(),
            });

            let approved = feedback.is_approved;
            trace.feedback_history.push(feedback);

            if !approved {
                continue;
            }

            // ── EXECUTE ───────────────────────────────────────────────
            let dag = trace.dag_history.last().expect("approved dag exists");
            let result = execute_dag(dag, dataset, self.config.node_timeout);

            trace.conversation.push(TraceMessage::new(
                TraceRole::Executor,
                if result.success {
                    format!(
                        "[Executor] {question_id}: SUCCESS — answer={} ({:.1}ms)",
                        result
                            .final_answer
                            .as_ref()
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "null".to_string()),
                        result.execution_time_ms
                    )
                } else {
                    format!(
                        "[Executor] {question_id}: FAILED — {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    )
                },
            ));
            stream.publish(EventKind::ExecutionDone {
                question_id: question_id.clone(),
                success: result.success,
                final_answer: result.final_answer.clone(),
                execution_time_ms: result.execution_time_ms,
                error: result.error.clone(),
            });

            trace.execution_result = Some(result);
            break;
        }

        stream.publish(EventKind::QuestionComplete {
            question_id: question_id.clone(),
            success: trace.passed(),
            iterations: trace.total_iterations,
        });

        trace
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

    fn critic_loop(mock: Arc<MockClient>, max_iterations: u32) -> CriticLoop {
        let config = ProbeConfig {
            max_iterations,
            ..ProbeConfig::default()
        };
        CriticLoop::new(mock, config, RetryPolicy::fast_for_tests())
    }

    fn one_node_dag_reply() -> serde_json::Value {
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

    fn cyclic_dag_reply() -> serde_json::Value {
        json!({
            "question_id": "q_01",
            "description": "broken",
            "nodes": [
                {"node_id": "a", "operation": "", "function_name": "f",
                 "inputs": {"x": "dataset.total"}, "expected_output_type": "int",
                 "layer": 0, "code": "def f(x): return x"},
                {"node_id": "b", "operation": "", "function_name": "g",
                 "inputs": {"x": "prev_node.a.output"}, "expected_output_type": "int",
                 "layer": 1, "code": "def g(x): return x"}
            ],
            "edges": [
                {"source": "a", "target": "b"},
                {"source": "b", "target": "a"}
            ],
            "final_answer_node": "b"
        })
    }

    fn approve_reply() -> serde_json::Value {
        json!({"is_valid": true, "node_assessments": {}, "issues": []})
    }

    async fn run(cl: &CriticLoop, stream: &RunStream) -> QuestionTrace {
        let cancelled = AtomicBool::new(false);
        cl.run(question(), &dataset(), &Metadata::default(), stream, &cancelled)
            .await
    }

    async fn drain(stream: &RunStream) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while stream.pending() > 0 {
            kinds.push(stream.next().await.unwrap().kind);
        }
        kinds
    }

    // ═══════════════════════════════════════════════════════════════
    // Scenario: approve on first iteration
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn trivial_question_approved_first_iteration() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(one_node_dag_reply()); // builder
        mock.push_json(approve_reply()); // critic layer 0

        let stream = RunStream::new(64);
        let trace = run(&critic_loop(mock, 3), &stream).await;

        assert_eq!(trace.total_iterations, 1);
        assert!(trace.passed());
        let result = trace.execution_result.as_ref().unwrap();
        assert_eq!(result.final_answer, Some(json!(42)));
        assert_eq!(trace.dag_history.len(), 1);
        assert_eq!(trace.feedback_history.len(), 1);
        // conversation has builder, critic, executor entries in order
        let roles: Vec<TraceRole> = trace.conversation.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![TraceRole::DagBuilder, TraceRole::Critic, TraceRole::Executor]
        );

        // event order: dag_built < critic_result < execution_done < question_complete
        let kinds = drain(&stream).await;
        assert!(matches!(kinds[0], EventKind::DagBuilt { iteration: 1, .. }));
        assert!(matches!(
            kinds[1],
            EventKind::CriticResult {
                is_approved: true,
                ..
            }
        ));
        assert!(matches!(kinds[2], EventKind::ExecutionDone { success: true, .. }));
        assert!(matches!(
            kinds[3],
            EventKind::QuestionComplete { success: true, .. }
        ));
    }

    // ═══════════════════════════════════════════════════════════════
    // Scenario: cycle rejected, repaired on iteration 2
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn cycle_rejected_then_repaired() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(cyclic_dag_reply()); // iteration 1: rejected in phase 1
        mock.push_json(one_node_dag_reply()); // iteration 2
        mock.push_json(approve_reply()); // critic layer 0

        let stream = RunStream::new(64);
        let trace = run(&critic_loop(mock, 3), &stream).await;

        assert_eq!(trace.total_iterations, 2);
        assert!(trace.passed());
        assert_eq!(trace.dag_history.len(), 2);
        assert!(!trace.feedback_history[0].is_approved);
        assert!(trace.feedback_history[0]
            .specific_errors
            .iter()
            .any(|e| e.contains("cycle")));
        assert!(trace.feedback_history[1].is_approved);

        // the rebuild prompt carried the cycle feedback
        let kinds = drain(&stream).await;
        assert!(matches!(kinds[0], EventKind::DagBuilt { iteration: 1, .. }));
        assert!(matches!(
            kinds[1],
            EventKind::CriticResult {
                is_approved: false,
                iteration: 1,
                ..
            }
        ));
        assert!(matches!(kinds[2], EventKind::DagBuilt { iteration: 2, .. }));
    }

    // ═══════════════════════════════════════════════════════════════
    // Scenario: exhaustion
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn exhaustion_gives_up_with_full_history() {
        let mock = Arc::new(MockClient::new());
        for _ in 0..3 {
            mock.push_json(cyclic_dag_reply());
        }

        let stream = RunStream::new(64);
        let trace = run(&critic_loop(mock, 3), &stream).await;

        assert!(trace.execution_result.is_none());
        assert_eq!(trace.total_iterations, 3);
        assert_eq!(trace.dag_history.len(), 3);
        assert_eq!(trace.feedback_history.len(), 3);
        assert!(trace.feedback_history.iter().all(|f| !f.is_approved));

        let kinds = drain(&stream).await;
        let last = kinds.last().unwrap();
        assert!(matches!(
            last,
            EventKind::QuestionComplete {
                success: false,
                iterations: 3,
                ..
            }
        ));
    }

    // ═══════════════════════════════════════════════════════════════
    // Boundary: MAX = 0 and history/iteration invariants
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn zero_max_iterations_gives_up_without_building() {
        let mock = Arc::new(MockClient::new());
        let stream = RunStream::new(64);
        let trace = run(&critic_loop(mock.clone(), 0), &stream).await;

        assert!(trace.execution_result.is_none());
        assert_eq!(trace.total_iterations, 0);
        assert!(trace.dag_history.is_empty());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn iteration_count_matches_history_index() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(cyclic_dag_reply());
        mock.push_json(cyclic_dag_reply());
        let stream = RunStream::new(64);
        let trace = run(&critic_loop(mock, 2), &stream).await;

        // dag_history[i] was inserted when iteration_count == i + 1
        assert_eq!(trace.dag_history.len() as u32, trace.total_iterations);
        assert_eq!(trace.feedback_history.len(), trace.dag_history.len());
    }

    // ═══════════════════════════════════════════════════════════════
    // Execution failure is terminal (no rebuild)
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn execution_failure_does_not_rebuild() {
        let mock = Arc::new(MockClient::new());
        mock.push_json(json!({
            "question_id": "q_01",
            "description": "division",
            "nodes": [{
                "node_id": "a",
                "operation": "divide",
                "function_name": "div",
                "inputs": {"x": "dataset.total"},
                "expected_output_type": "float",
                "layer": 0,
                "code": "def div(x): return x / 0"
            }],
            "edges": [],
            "final_answer_node": "a"
        }));
        mock.push_json(approve_reply());

        let stream = RunStream::new(64);
        let trace = run(&critic_loop(mock.clone(), 3), &stream).await;

        assert_eq!(trace.total_iterations, 1);
        assert!(!trace.passed());
        let result = trace.execution_result.as_ref().unwrap();
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("ZeroDivisionError"));
        // exactly 2 LLM calls: one build, one critic layer — no rebuild
        assert_eq!(mock.call_count(), 2);
    }

    // ═══════════════════════════════════════════════════════════════
    // Cancellation
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn cancelled_loop_gives_up_immediately() {
        let mock = Arc::new(MockClient::new());
        let stream = RunStream::new(64);
        let cancelled = AtomicBool::new(true);
        let trace = critic_loop(mock.clone(), 3)
            .run(question(), &dataset(), &Metadata::default(), &stream, &cancelled)
            .await;

        assert!(trace.execution_result.is_none());
        assert_eq!(trace.total_iterations, 0);
        assert_eq!(mock.call_count(), 0);
        assert!(trace
            .conversation
            .iter()
            .any(|m| m.content.contains("cancelled")));
    }
}
