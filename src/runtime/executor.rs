//! DAG executor - layer-ordered evaluation over a dataset
//!
//! Runs only after critic approval. Nodes within a layer are independent;
//! they run sequentially here because node work is microseconds and the
//! pipeline's concurrency lives at the question level.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::dag::{extract_layers, InputRef};
use crate::dataset::Dataset;
use crate::model::{ExecutionResult, GeneratedDag, NodeExecutionResult};
use crate::sandbox;

/// Execute a validated DAG over the dataset.
///
/// Per-node time covers the sandbox call only; the result's total time is
/// wall time across all layers. On the first failing node execution stops,
/// keeping earlier outputs in the result for the trace.
pub fn execute_dag(dag: &GeneratedDag, dataset: &Dataset, node_timeout: Duration) -> ExecutionResult {
    let started = Instant::now();
    let mut node_outputs: BTreeMap<String, Value> = BTreeMap::new();
    let mut node_results: Vec<NodeExecutionResult> = Vec::with_capacity(dag.nodes.len());

    for (layer_idx, layer) in extract_layers(dag).into_iter().enumerate() {
        for node in layer {
            let mut resolved: BTreeMap<String, Value> = BTreeMap::new();
            let mut resolution_error: Option<String> = None;
            for (param, raw) in &node.inputs {
                let value = InputRef::parse(raw)
                    .and_then(|r| r.resolve(dataset, &node_outputs));
                match value {
                    Ok(v) => {
                        resolved.insert(param.clone(), v);
                    }
                    Err(e) => {
                        resolution_error = Some(format!(
                            "Input resolution failed for node '{}' in layer {layer_idx}: {e}",
                            node.node_id
                        ));
                        break;
                    }
                }
            }

            if let Some(error) = resolution_error {
                warn!(node_id = %node.node_id, %error, "input resolution failed");
                node_results.push(NodeExecutionResult {
                    node_id: node.node_id.clone(),
                    success: false,
                    output: None,
                    error: Some(error.clone()),
                    execution_time_ms: 0.0,
                });
                return failed(dag, node_outputs, node_results, error, started);
            }

            let result = sandbox::execute_node(node, &resolved, node_timeout);
            debug!(node_id = %node.node_id, success = result.success, "node executed");

            if result.success {
                if let Some(output) = &result.output {
                    node_outputs.insert(node.node_id.clone(), output.clone());
                }
                node_results.push(result);
            } else {
                let error = format!(
                    "Node '{}' in layer {layer_idx} failed: {}",
                    node.node_id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                node_results.push(result);
                return failed(dag, node_outputs, node_results, error, started);
            }
        }
    }

    let final_answer = node_outputs.get(&dag.final_answer_node).cloned();
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    // A final node that returned nothing is a silent failure: the function
    // fell off its end or final_answer_node points at the wrong node.
    if final_answer.is_none() || final_answer == Some(Value::Null) {
        let error = format!(
            "Final answer node '{}' returned no value. The function must end with a return \
statement and final_answer_node must name the right node.",
            dag.final_answer_node
        );
        warn!(question_id = %dag.question_id, "final answer was null");
        return ExecutionResult {
            question_id: dag.question_id.clone(),
            success: false,
            final_answer: None,
            node_results,
            node_outputs,
            error: Some(error),
            execution_time_ms: elapsed_ms,
        };
    }

    ExecutionResult {
        question_id: dag.question_id.clone(),
        success: true,
        final_answer,
        node_results,
        node_outputs,
        error: None,
        execution_time_ms: elapsed_ms,
    }
}

fn failed(
    dag: &GeneratedDag,
    node_outputs: BTreeMap<String, Value>,
    node_results: Vec<NodeExecutionResult>,
    error: String,
    started: Instant,
) -> ExecutionResult {
    ExecutionResult {
        question_id: dag.question_id.clone(),
        success: false,
        final_answer: None,
        node_results,
        node_outputs,
        error: Some(error),
        execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
    }
}
