//! Core data model
//!
//! Everything here is a plain value: cross-links are string identifiers, so
//! full audit traces serialize without any graph bookkeeping. DAGs carry no
//! parent pointers — the node ID is the only handle.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ═══════════════════════════════════════════════════════════════
// Questions
// ═══════════════════════════════════════════════════════════════

/// Difficulty bucket, derived from `difficulty_rank`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyLevel {
    Easy,
    Medium,
    Hard,
}

impl DifficultyLevel {
    /// Bucket a 1-based rank into easy/medium/hard thirds
    pub fn from_rank(rank: u32, total: usize) -> Self {
        let total = total.max(1) as u32;
        let third = total.div_ceil(3);
        if rank <= third {
            Self::Easy
        } else if rank <= total - total / 3 {
            Self::Medium
        } else {
            Self::Hard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }
}

impl std::fmt::Display for DifficultyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DifficultyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            other => Err(format!("unknown difficulty level '{other}'")),
        }
    }
}

/// A single evaluation question generated from the dataset.
///
/// Immutable once created; IDs are unique within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    /// Unique question identifier, e.g. "q_01"
    pub id: String,
    /// The question text
    pub text: String,
    /// Rank from 1 (easiest) to N (hardest)
    pub difficulty_rank: u32,
    pub difficulty_level: DifficultyLevel,
    /// Why this difficulty was assigned
    #[serde(default)]
    pub reasoning: String,
    /// Which dataset keys are relevant to answering this question
    #[serde(default)]
    pub relevant_data_keys: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════
// Generated DAGs
// ═══════════════════════════════════════════════════════════════

/// A single node in a generated DAG — one executable step.
///
/// `inputs` maps parameter names to reference expressions:
/// `dataset.<key>` or `prev_node.<node_id>.output`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DagNode {
    /// Unique node identifier, e.g. "step_1a"
    pub node_id: String,
    /// Human-readable description of what this step does
    #[serde(default)]
    pub operation: String,
    /// Name of the function defined in `code`
    pub function_name: String,
    /// Parameter mapping: param name → reference expression
    #[serde(default, deserialize_with = "deserialize_inputs")]
    pub inputs: BTreeMap<String, String>,
    /// Expected return type, e.g. "float", "dict"
    #[serde(default)]
    pub expected_output_type: String,
    /// Execution layer (0 = no deps, higher = later)
    pub layer: u32,
    /// The function source executed in the sandbox
    pub code: String,
}

/// A dependency edge in a generated DAG
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DagEdge {
    /// node_id of the upstream node
    pub source: String,
    /// node_id of the downstream node
    pub target: String,
}

/// Complete DAG structure for one question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedDag {
    pub question_id: String,
    /// LLM's explanation of the overall approach
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<DagNode>,
    #[serde(default)]
    pub edges: Vec<DagEdge>,
    /// node_id whose output is the final answer
    #[serde(default)]
    pub final_answer_node: String,
}

impl GeneratedDag {
    /// Empty DAG used as the builder's fallback after retry exhaustion.
    /// The critic rejects it as critically broken instead of crashing the loop.
    pub fn empty(question_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            description: description.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            final_answer_node: String::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Input reference expressions must be strings, but LLMs occasionally emit
/// scalar literals in input position. Coerce those to their string form here
/// so structural validation can reject them with an actionable message
/// instead of failing the whole response parse.
fn deserialize_inputs<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Value> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect())
}

// ═══════════════════════════════════════════════════════════════
// Critic feedback
// ═══════════════════════════════════════════════════════════════

/// Critic's verdict on a single layer of the DAG
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerValidation {
    pub layer_index: u32,
    /// node_ids in this layer
    pub nodes_in_layer: Vec<String>,
    pub is_valid: bool,
    /// Error descriptions; a valid layer may carry a provisional-approval note
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Complete feedback from the critic for one DAG.
///
/// The DAG builder uses this to understand exactly what went wrong and
/// regenerate the complete DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriticFeedback {
    pub is_approved: bool,
    /// High-level summary of the DAG's quality
    pub overall_reasoning: String,
    /// Ordered by layer_index
    #[serde(default)]
    pub layer_validations: Vec<LayerValidation>,
    /// Actionable error descriptions for the builder
    #[serde(default)]
    pub specific_errors: Vec<String>,
    /// Improvement hints for the next iteration
    #[serde(default)]
    pub suggestions: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════
// Execution results
// ═══════════════════════════════════════════════════════════════

/// Result of executing a single DAG node in the sandbox
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeExecutionResult {
    pub node_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

/// Result of executing one approved DAG
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub question_id: String,
    pub success: bool,
    #[serde(default)]
    pub final_answer: Option<Value>,
    /// Per-node results in execution order (a prefix of a topological order)
    #[serde(default)]
    pub node_results: Vec<NodeExecutionResult>,
    /// node_id → output for every node that completed before any failure
    #[serde(default)]
    pub node_outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

// ═══════════════════════════════════════════════════════════════
// Audit traces
// ═══════════════════════════════════════════════════════════════

/// Role tags for the per-question conversation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceRole {
    DagBuilder,
    Critic,
    Executor,
}

/// One role-tagged message in the conversation log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceMessage {
    pub role: TraceRole,
    pub content: String,
}

impl TraceMessage {
    pub fn new(role: TraceRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Full audit trail for one question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionTrace {
    pub question: Question,
    /// Every DAG the builder produced, in order
    pub dag_history: Vec<GeneratedDag>,
    /// Critic feedback per iteration, parallel to `dag_history`
    pub feedback_history: Vec<CriticFeedback>,
    /// Null if the loop gave up before approval
    #[serde(default)]
    pub execution_result: Option<ExecutionResult>,
    pub total_iterations: u32,
    /// Ordered builder/critic/executor messages
    #[serde(default)]
    pub conversation: Vec<TraceMessage>,
}

impl QuestionTrace {
    /// Whether this question counts as passed (execution succeeded)
    pub fn passed(&self) -> bool {
        self.execution_result
            .as_ref()
            .is_some_and(|r| r.success)
    }
}

// ═══════════════════════════════════════════════════════════════
// Run reports
// ═══════════════════════════════════════════════════════════════

/// Per-difficulty pass/fail counts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DifficultyStats {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub pass_rate: f64,
}

/// Top-level run summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub pass_rate: f64,
    /// Mean over successfully executed questions only
    pub avg_execution_time_ms: f64,
    /// Critic-loop iterations summed across all questions
    pub total_iterations: u32,
    /// RFC 3339 UTC timestamp of report creation
    pub timestamp: String,
    pub dataset_name: String,
}

/// The persisted output of one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub summary: RunSummary,
    /// easy/medium/hard → stats
    pub difficulty_breakdown: BTreeMap<String, DifficultyStats>,
    /// Sorted by difficulty_rank so the report is interleaving-independent
    pub question_traces: Vec<QuestionTrace>,
}
