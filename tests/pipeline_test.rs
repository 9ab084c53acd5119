//! End-to-end pipeline scenarios
//!
//! Full runs against the mock provider: single trivial question, execution
//! failure isolation, fan-out ordering, and interleaving-independent
//! reports.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value};

use tabprobe::config::ProbeConfig;
use tabprobe::dataset::{Dataset, Metadata};
use tabprobe::event::{EventKind, RunStream};
use tabprobe::llm::{LlmError, MockClient, RetryPolicy};
use tabprobe::runtime::{Orchestrator, RunOptions};
use tabprobe::RunReport;

// ═══════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════

fn dataset() -> Arc<Dataset> {
    Arc::new(
        json!({"total": 42, "values": [1, 2, 3, 4]})
            .as_object()
            .unwrap()
            .clone(),
    )
}

fn metadata() -> Option<Arc<Metadata>> {
    Some(Arc::new(
        serde_json::from_value(json!({
            "description": "tiny fixture",
            "domain": "testing",
            "dataset_keys": {"total": "a scalar", "values": "a list"}
        }))
        .unwrap(),
    ))
}

fn two_questions_reply() -> Value {
    json!({"questions": [
        {"id": "q_01", "text": "What is total?", "difficulty_rank": 1,
         "difficulty_level": "easy", "reasoning": "lookup",
         "relevant_data_keys": ["total"]},
        {"id": "q_02", "text": "What is the sum of values?", "difficulty_rank": 2,
         "difficulty_level": "easy", "reasoning": "aggregate",
         "relevant_data_keys": ["values"]}
    ]})
}

fn identity_dag(question_id: &str) -> Value {
    json!({
        "question_id": question_id,
        "description": "return the total",
        "nodes": [{
            "node_id": "a", "operation": "identity", "function_name": "ret",
            "inputs": {"x": "dataset.total"}, "expected_output_type": "int",
            "layer": 0, "code": "def ret(x): return x"
        }],
        "edges": [],
        "final_answer_node": "a"
    })
}

fn sum_dag(question_id: &str) -> Value {
    json!({
        "question_id": question_id,
        "description": "sum the values",
        "nodes": [{
            "node_id": "a", "operation": "sum", "function_name": "total",
            "inputs": {"xs": "dataset.values"}, "expected_output_type": "int",
            "layer": 0, "code": "def total(xs): return sum(xs)"
        }],
        "edges": [],
        "final_answer_node": "a"
    })
}

fn zero_division_dag(question_id: &str) -> Value {
    json!({
        "question_id": question_id,
        "description": "divide by zero",
        "nodes": [{
            "node_id": "a", "operation": "divide", "function_name": "div",
            "inputs": {"x": "dataset.total"}, "expected_output_type": "float",
            "layer": 0, "code": "def div(x): return x / 0"
        }],
        "edges": [],
        "final_answer_node": "a"
    })
}

fn approve_reply() -> Value {
    json!({"is_valid": true, "node_assessments": {}, "issues": []})
}

/// Routing mock: question-gen, builder and critic requests are told apart
/// by their system prompts; builder replies are chosen per question id.
fn pipeline_mock(
    questions_reply: Value,
    dag_for: impl Fn(&str) -> Value + Send + Sync + 'static,
) -> Arc<MockClient> {
    Arc::new(MockClient::with_handler(move |req| {
        if req.system.contains("question designer") {
            return Ok(questions_reply.to_string());
        }
        if req.system.contains("computational planner") {
            let question_id = req
                .user
                .lines()
                .skip_while(|l| !l.starts_with("## Question ID"))
                .nth(1)
                .unwrap_or("")
                .trim()
                .to_string();
            return Ok(dag_for(&question_id).to_string());
        }
        if req.system.contains("code reviewer") {
            return Ok(approve_reply().to_string());
        }
        Err(LlmError::Fatal(format!(
            "unrecognized request: {}",
            &req.system[..40.min(req.system.len())]
        )))
    }))
}

fn orchestrator(mock: Arc<MockClient>, max_concurrent: usize) -> Orchestrator {
    let config = ProbeConfig {
        max_concurrent,
        ..ProbeConfig::default()
    };
    Orchestrator::new(mock, config).with_retry(RetryPolicy::fast_for_tests())
}

async fn run_pipeline(
    orch: &Orchestrator,
    opts: &RunOptions,
    stream: &RunStream,
) -> tabprobe::Result<RunReport> {
    let cancelled = Arc::new(AtomicBool::new(false));
    orch.run(
        "test-run",
        dataset(),
        metadata(),
        opts,
        stream,
        &cancelled,
        "fixture",
    )
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
// SCENARIO: single trivial question
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn single_trivial_question_passes_first_iteration() {
    let mock = Arc::new(MockClient::new());
    mock.push_json(json!({"questions": [
        {"id": "q_01", "text": "What is total?", "difficulty_rank": 1,
         "difficulty_level": "easy", "reasoning": "lookup",
         "relevant_data_keys": ["total"]}
    ]}));
    mock.push_json(identity_dag("q_01"));
    mock.push_json(approve_reply());

    let orch = orchestrator(mock, 1);
    let stream = RunStream::new(256);
    let opts = RunOptions {
        num_questions: 1,
        ..RunOptions::default()
    };
    let report = run_pipeline(&orch, &opts, &stream).await.unwrap();

    assert_eq!(report.summary.total, 1);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.pass_rate, 1.0);
    assert_eq!(report.summary.total_iterations, 1);

    let trace = &report.question_traces[0];
    assert_eq!(trace.total_iterations, 1);
    let result = trace.execution_result.as_ref().unwrap();
    assert_eq!(result.final_answer, Some(json!(42)));

    let kinds = drain(&stream).await;
    assert!(matches!(kinds[0], EventKind::RunStarted { .. }));
    assert!(matches!(kinds[1], EventKind::QuestionsGenerated { count: 1, .. }));
}

// ═══════════════════════════════════════════════════════════════
// SCENARIO: execution failure after approval, sibling unaffected
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn execution_failure_is_isolated_per_question() {
    let mock = pipeline_mock(two_questions_reply(), |question_id| {
        if question_id == "q_01" {
            zero_division_dag(question_id)
        } else {
            sum_dag(question_id)
        }
    });

    let orch = orchestrator(mock, 2);
    let stream = RunStream::new(256);
    let opts = RunOptions {
        num_questions: 2,
        ..RunOptions::default()
    };
    let report = run_pipeline(&orch, &opts, &stream).await.unwrap();

    // invariant: |completed| + |failed| = |questions|
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.passed + report.summary.failed, 2);
    assert_eq!(report.summary.passed, 1);

    let q1 = &report.question_traces[0];
    assert_eq!(q1.question.id, "q_01");
    let r1 = q1.execution_result.as_ref().unwrap();
    assert!(!r1.success);
    assert!(r1.error.as_ref().unwrap().contains("ZeroDivisionError"));
    // no rebuild after execution failure
    assert_eq!(q1.total_iterations, 1);

    let q2 = &report.question_traces[1];
    assert!(q2.passed());
    assert_eq!(
        q2.execution_result.as_ref().unwrap().final_answer,
        Some(json!(10))
    );
}

// ═══════════════════════════════════════════════════════════════
// SCENARIO: fan-out ordering and interleaving independence
// ═══════════════════════════════════════════════════════════════

fn positions_for(kinds: &[EventKind], question_id: &str) -> Vec<usize> {
    kinds
        .iter()
        .enumerate()
        .filter(|(_, k)| k.question_id() == Some(question_id))
        .map(|(i, _)| i)
        .collect()
}

#[tokio::test]
async fn per_question_event_order_holds_under_fanout() {
    let mock = pipeline_mock(two_questions_reply(), |question_id| {
        if question_id == "q_01" {
            identity_dag(question_id)
        } else {
            sum_dag(question_id)
        }
    });

    let orch = orchestrator(mock, 2);
    let stream = RunStream::new(256);
    let opts = RunOptions {
        num_questions: 2,
        ..RunOptions::default()
    };
    run_pipeline(&orch, &opts, &stream).await.unwrap();

    let kinds = drain(&stream).await;

    for question_id in ["q_01", "q_02"] {
        let events: Vec<&EventKind> = kinds
            .iter()
            .filter(|k| k.question_id() == Some(question_id))
            .collect();
        // dag_built < critic_result < execution_done < question_complete
        assert!(
            matches!(events[0], EventKind::DagBuilt { .. }),
            "{question_id}: {events:?}"
        );
        assert!(matches!(events[1], EventKind::CriticResult { .. }));
        assert!(matches!(events[2], EventKind::ExecutionDone { .. }));
        assert!(matches!(events[3], EventKind::QuestionComplete { .. }));

        // per-question positions are strictly increasing by construction;
        // cross-question interleaving is unconstrained
        let positions = positions_for(&kinds, question_id);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}

#[tokio::test]
async fn report_is_identical_regardless_of_concurrency() {
    let make_mock = || {
        pipeline_mock(two_questions_reply(), |question_id| {
            if question_id == "q_01" {
                identity_dag(question_id)
            } else {
                sum_dag(question_id)
            }
        })
    };
    let opts = RunOptions {
        num_questions: 2,
        ..RunOptions::default()
    };

    let sequential = orchestrator(make_mock(), 1);
    let concurrent = orchestrator(make_mock(), 2);

    let mut report_a = run_pipeline(&sequential, &opts, &RunStream::new(256))
        .await
        .unwrap();
    let mut report_b = run_pipeline(&concurrent, &opts, &RunStream::new(256))
        .await
        .unwrap();

    // timestamps and timings differ run to run; normalize them
    report_a.summary.timestamp = String::new();
    report_b.summary.timestamp = String::new();
    report_a.summary.avg_execution_time_ms = 0.0;
    report_b.summary.avg_execution_time_ms = 0.0;
    for report in [&mut report_a, &mut report_b] {
        for trace in &mut report.question_traces {
            if let Some(result) = &mut trace.execution_result {
                result.execution_time_ms = 0.0;
                for node in &mut result.node_results {
                    node.execution_time_ms = 0.0;
                }
            }
        }
    }

    assert_eq!(report_a, report_b);
}

// ═══════════════════════════════════════════════════════════════
// SCENARIO: sandbox violation rejected by the critic
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn import_in_node_code_is_rejected_even_with_valid_topology() {
    let mock = Arc::new(MockClient::new());
    mock.push_json(json!({"questions": [
        {"id": "q_01", "text": "What is total?", "difficulty_rank": 1,
         "difficulty_level": "easy", "reasoning": "", "relevant_data_keys": []}
    ]}));
    // 3 iterations of the same unsafe DAG → exhaustion
    for _ in 0..3 {
        mock.push_json(json!({
            "question_id": "q_01",
            "description": "sneaky",
            "nodes": [{
                "node_id": "a", "operation": "identity", "function_name": "f",
                "inputs": {"x": "dataset.total"}, "expected_output_type": "int",
                "layer": 0, "code": "def f(x):\n    import os\n    return 1"
            }],
            "edges": [],
            "final_answer_node": "a"
        }));
        // topology is fine, so phase 2 runs; approve the layer so only the
        // safety scan's structural finding drives the rejection
        mock.push_json(approve_reply());
    }

    let orch = orchestrator(mock, 1);
    let stream = RunStream::new(256);
    let opts = RunOptions {
        num_questions: 1,
        ..RunOptions::default()
    };
    let report = run_pipeline(&orch, &opts, &stream).await.unwrap();

    assert_eq!(report.summary.failed, 1);
    let trace = &report.question_traces[0];
    assert!(trace.execution_result.is_none());
    assert_eq!(trace.feedback_history.len(), 3);
    assert!(trace.feedback_history.iter().all(|f| !f.is_approved));
    assert!(trace.feedback_history[0]
        .specific_errors
        .iter()
        .any(|e| e.to_lowercase().contains("import")));
}

// ═══════════════════════════════════════════════════════════════
// Persisted report round-trip via run_to_file
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn run_to_file_persists_report_and_emits_terminal_event() {
    let mock = pipeline_mock(two_questions_reply(), |question_id| {
        if question_id == "q_01" {
            identity_dag(question_id)
        } else {
            sum_dag(question_id)
        }
    });

    let orch = orchestrator(mock, 2);
    let stream = RunStream::new(256);
    let cancelled = Arc::new(AtomicBool::new(false));
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("eval_results_test.json");

    let opts = RunOptions {
        num_questions: 2,
        ..RunOptions::default()
    };
    let report = orch
        .run_to_file(
            "test-run",
            dataset(),
            metadata(),
            &opts,
            &stream,
            &cancelled,
            "fixture",
            &output,
        )
        .await
        .unwrap();

    // persisted JSON parses back into an equal report
    let raw = std::fs::read_to_string(&output).unwrap();
    let parsed: RunReport = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed, report);

    let kinds = drain(&stream).await;
    let last = kinds.last().unwrap();
    let EventKind::RunComplete {
        output_file,
        summary,
    } = last
    else {
        panic!("expected run_complete, got {last:?}");
    };
    assert_eq!(output_file, "eval_results_test.json");
    assert_eq!(summary.total, 2);
    // stream is closed: further publishes are discarded
    assert!(stream.is_closed());
}

// ═══════════════════════════════════════════════════════════════
// Validation failures are fatal before any LLM call
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn empty_dataset_aborts_before_llm() {
    let mock = Arc::new(MockClient::new());
    let orch = orchestrator(mock.clone(), 1);
    let stream = RunStream::new(256);
    let cancelled = Arc::new(AtomicBool::new(false));

    let empty: Arc<Dataset> = Arc::new(serde_json::Map::new());
    let err = orch
        .run(
            "test-run",
            empty,
            metadata(),
            &RunOptions::default(),
            &stream,
            &cancelled,
            "fixture",
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PROBE-002");
    assert_eq!(err.exit_code(), 1);
    assert_eq!(mock.call_count(), 0);
    // nothing was published — the gate fires before run_started
    assert_eq!(stream.pending(), 0);
}

#[tokio::test]
async fn missing_metadata_warns_in_run_started_and_continues() {
    let mock = Arc::new(MockClient::new());
    mock.push_json(json!({"questions": [
        {"id": "q_01", "text": "What is total?", "difficulty_rank": 1,
         "difficulty_level": "easy", "reasoning": "", "relevant_data_keys": []}
    ]}));
    mock.push_json(identity_dag("q_01"));
    mock.push_json(approve_reply());

    let orch = orchestrator(mock, 1);
    let stream = RunStream::new(256);
    let cancelled = Arc::new(AtomicBool::new(false));
    let report = orch
        .run(
            "test-run",
            dataset(),
            None, // no metadata document
            &RunOptions {
                num_questions: 1,
                ..RunOptions::default()
            },
            &stream,
            &cancelled,
            "fixture",
        )
        .await
        .unwrap();

    assert_eq!(report.summary.passed, 1);
    let kinds = drain(&stream).await;
    let EventKind::RunStarted { warnings, .. } = &kinds[0] else {
        panic!("expected run_started first");
    };
    assert!(warnings.iter().any(|w| w.contains("metadata")));
}
