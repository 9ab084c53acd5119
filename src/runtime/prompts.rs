//! Prompt construction for the three LLM roles
//!
//! Prompts always show exact field names from the bundle and metadata.
//! Models hallucinate key names the moment a schema is summarized loosely,
//! and every hallucinated key costs one full critic-loop iteration.

use serde_json::Value;

use crate::dataset::{summarize_structure, Dataset, Metadata};
use crate::model::{CriticFeedback, DagNode, GeneratedDag, Question};

/// Structure summary depth for question generation
const SUMMARY_DEPTH: usize = 3;

// ═══════════════════════════════════════════════════════════════
// Question generation
// ═══════════════════════════════════════════════════════════════

pub fn question_gen_system(count: usize) -> String {
    let easy_end = count.div_ceil(3);
    let medium_end = count - count / 3;
    format!(
        "You are an expert evaluation question designer. Given a dataset and its metadata, \
you generate exactly {count} questions that test analytical and computational skills on the data.

Requirements:
- Generate exactly {count} questions, ranked from easiest (rank 1) to hardest (rank {count})
- Difficulty distribution: ranks 1-{easy_end} = \"easy\", ranks {}-{medium_end} = \"medium\", ranks {}-{count} = \"hard\"
- Each question must be answerable using ONLY the provided dataset
- Questions should require multi-step computation, not simple lookups

Content guidelines:
- PREFER questions about aggregates, rates, statistics, distributions, rankings and trends
- PREFER questions that use the pre-aggregated keys for global figures
- AVOID questions that list, extract or enumerate individual PII values
- AVOID questions whose answer is a list of person names or identifiers

Respond with a JSON object of this exact shape:
{{
  \"questions\": [
    {{
      \"id\": \"q_01\",
      \"text\": \"What is the average amount across all categories?\",
      \"difficulty_rank\": 1,
      \"difficulty_level\": \"easy\",
      \"reasoning\": \"Single aggregate over one key\",
      \"relevant_data_keys\": [\"category_stats\"]
    }}
  ]
}}",
        easy_end + 1,
        medium_end + 1,
    )
}

pub fn build_question_gen_prompt(dataset: &Dataset, metadata: &Metadata, count: usize) -> String {
    let metadata_json =
        serde_json::to_string_pretty(metadata).unwrap_or_else(|_| "{}".to_string());
    format!(
        "Generate {count} evaluation questions for this dataset.\n\n\
## Dataset Metadata\n{metadata_json}\n\n\
## Dataset Structure\n{}\n\n\
Generate exactly {count} questions ranked easy to hard. Respond with JSON only.",
        summarize_structure(dataset, SUMMARY_DEPTH)
    )
}

// ═══════════════════════════════════════════════════════════════
// DAG generation
// ═══════════════════════════════════════════════════════════════

pub const DAG_GEN_SYSTEM: &str = "You are an expert computational planner. Given a question \
about a dataset, you design a directed acyclic graph (DAG) of small executable functions that \
jointly compute the answer.

## DAG rules
1. Each node is one function that takes inputs and returns a single value
2. Nodes are organized in layers: layer 0 has no dependencies; a node at layer N may depend only on layers < N
3. Every input is a reference expression: \"dataset.<key>\" for bundle data or \"prev_node.<node_id>.output\" for an upstream node's output — never a literal value
4. Every prev_node reference needs a matching edge from that node
5. final_answer_node names the node whose output answers the question; every node must contribute to it
6. Code is self-contained: the safe modules (math, statistics, collections, itertools, functools, json, re, datetime, decimal, fractions, random, operator, string) are pre-loaded — NO import statements
7. Each function must be named exactly as its function_name field says

## Response format (JSON object)
{
  \"question_id\": \"q_01\",
  \"description\": \"Overall approach\",
  \"nodes\": [
    {
      \"node_id\": \"step_1a\",
      \"operation\": \"What this step does\",
      \"function_name\": \"extract_amounts\",
      \"inputs\": {\"rows\": \"dataset.transactions\"},
      \"expected_output_type\": \"list\",
      \"layer\": 0,
      \"code\": \"def extract_amounts(rows):\\n    return [r['amount'] for r in rows]\"
    }
  ],
  \"edges\": [
    {\"source\": \"step_1a\", \"target\": \"step_2a\"}
  ],
  \"final_answer_node\": \"step_2a\"
}";

pub fn build_dag_prompt(
    question: &Question,
    dataset: &Dataset,
    metadata: &Metadata,
    prior: Option<(&GeneratedDag, &CriticFeedback)>,
) -> String {
    let mut parts = vec![
        format!("## Question\n{}\n", question.text),
        format!("## Question ID\n{}\n", question.id),
        format!(
            "## Difficulty\nRank {} ({})\n",
            question.difficulty_rank, question.difficulty_level
        ),
        format!(
            "## Relevant Data Keys\n{}\n",
            question.relevant_data_keys.join(", ")
        ),
        format!("## Dataset Schema\n{}\n", build_schema_summary(dataset, metadata)),
    ];

    if let Some((previous_dag, feedback)) = prior {
        parts.push(build_feedback_section(previous_dag, feedback));
    }

    parts.push("Generate a complete DAG to answer this question. Respond with JSON only.".into());
    parts.join("\n")
}

fn build_feedback_section(previous_dag: &GeneratedDag, feedback: &CriticFeedback) -> String {
    let mut lines = vec![
        "## PREVIOUS ATTEMPT REJECTED".to_string(),
        String::new(),
        "### Overall assessment".to_string(),
        feedback.overall_reasoning.clone(),
        String::new(),
    ];

    for lv in &feedback.layer_validations {
        if !lv.is_valid {
            lines.push(format!(
                "### Layer {} issues (nodes: {})",
                lv.layer_index,
                lv.nodes_in_layer.join(", ")
            ));
            for issue in &lv.issues {
                lines.push(format!("  - {issue}"));
            }
            lines.push(String::new());
        }
    }

    if !feedback.specific_errors.is_empty() {
        lines.push("### Specific errors".to_string());
        for err in &feedback.specific_errors {
            lines.push(format!("  - {err}"));
        }
        lines.push(String::new());
    }

    if !feedback.suggestions.is_empty() {
        lines.push("### Suggestions".to_string());
        for s in &feedback.suggestions {
            lines.push(format!("  - {s}"));
        }
        lines.push(String::new());
    }

    let dag_json =
        serde_json::to_string_pretty(previous_dag).unwrap_or_else(|_| "{}".to_string());
    lines.push(
        "### Previous DAG (for reference only — produce a COMPLETE replacement, not a patch)"
            .to_string(),
    );
    lines.push(format!("```json\n{dag_json}\n```"));
    lines.push(String::new());

    lines.join("\n")
}

// ═══════════════════════════════════════════════════════════════
// Critic
// ═══════════════════════════════════════════════════════════════

pub const CRITIC_SYSTEM: &str = "You are a rigorous code reviewer for computation DAGs. You \
review one layer at a time and judge every node on:
1. Logical correctness: does the step make sense for the question?
2. Code correctness: will the function compute what its operation claims?
3. Type compatibility with upstream outputs and downstream expectations
4. Contribution: does the node move toward the final answer?
5. Edge cases: empty inputs, missing keys, divisions by zero
6. Field-name correctness: any dict key access not present in the documented
   schema is a CRITICAL error — models must not invent field names

Respond with a JSON object:
{
  \"is_valid\": true,
  \"node_assessments\": {
    \"step_1a\": {\"is_correct\": true, \"issues\": []}
  },
  \"issues\": []
}";

pub fn build_critic_layer_prompt(
    question: &Question,
    dag: &GeneratedDag,
    layer_index: u32,
    layer_nodes: &[&DagNode],
    validated_summary: &str,
    dataset: &Dataset,
    metadata: &Metadata,
) -> String {
    let mut lines = vec![
        format!("## Question\n{}\n", question.text),
        format!("## Dataset Schema\n{}\n", build_schema_summary(dataset, metadata)),
        format!(
            "## DAG Overview\n{} nodes, {} edges, final answer from '{}': {}\n",
            dag.nodes.len(),
            dag.edges.len(),
            dag.final_answer_node,
            dag.description
        ),
    ];

    if !validated_summary.is_empty() {
        lines.push(format!("## Already-Validated Upstream Layers\n{validated_summary}\n"));
    }

    lines.push(format!("## Layer {layer_index} Under Review\n"));
    for node in layer_nodes {
        let inputs = serde_json::to_string(&node.inputs).unwrap_or_else(|_| "{}".to_string());
        lines.push(format!(
            "### Node '{}'\nOperation: {}\nInputs: {}\nExpected output type: {}\nCode:\n```python\n{}\n```\n",
            node.node_id, node.operation, inputs, node.expected_output_type, node.code
        ));
    }

    lines.push(format!(
        "Review every node in layer {layer_index}. Respond with JSON only."
    ));
    lines.join("\n")
}

/// Approved node signatures of layers below `upto_layer`
pub fn build_validated_layers_summary(dag: &GeneratedDag, upto_layer: u32) -> String {
    let mut lines = Vec::new();
    for node in &dag.nodes {
        if node.layer < upto_layer {
            lines.push(format!(
                "- layer {}: {}({}) -> {}  [{}]",
                node.layer,
                node.function_name,
                node.inputs.keys().cloned().collect::<Vec<_>>().join(", "),
                node.expected_output_type,
                node.operation
            ));
        }
    }
    lines.join("\n")
}

// ═══════════════════════════════════════════════════════════════
// Schema summary
// ═══════════════════════════════════════════════════════════════

/// Rich schema for the builder and critic: per-column metadata plus the
/// exact nested field names of every bundle key.
pub fn build_schema_summary(dataset: &Dataset, metadata: &Metadata) -> String {
    let mut lines = Vec::new();

    if !metadata.description.is_empty() {
        lines.push(format!("Description: {}", metadata.description));
    }
    if !metadata.domain.is_empty() {
        lines.push(format!("Domain: {}", metadata.domain));
    }

    if !metadata.important_notes.is_empty() {
        lines.push("\nIMPORTANT NOTES:".to_string());
        for note in &metadata.important_notes {
            lines.push(format!("  ! {note}"));
        }
    }

    if !metadata.columns.is_empty() {
        lines.push("\nColumns:".to_string());
        for (name, col) in &metadata.columns {
            let mut attrs = Vec::new();
            if let Some(ty) = &col.column_type {
                attrs.push(ty.clone());
            }
            if let Some(fmt) = &col.format {
                attrs.push(format!("format={fmt}"));
            }
            if let Some(pat) = &col.strptime {
                attrs.push(format!("strptime={pat}"));
            }
            if col.nullable == Some(true) {
                match col.null_rate {
                    Some(rate) => attrs.push(format!("nullable ({:.1}% null)", rate * 100.0)),
                    None => attrs.push("nullable".to_string()),
                }
            }
            if col.is_pii() {
                attrs.push("PII - never surface raw values".to_string());
            }
            if let Some(values) = &col.values {
                let rendered: Vec<String> = values.iter().map(render_scalar).collect();
                attrs.push(format!("values: {}", rendered.join(", ")));
            }
            if let Some(range) = &col.range {
                attrs.push(format!("range: {range}"));
            }
            let desc = col.description.as_deref().unwrap_or("");
            let note = col
                .note
                .as_deref()
                .map(|n| format!("  NOTE: {n}"))
                .unwrap_or_default();
            lines.push(format!("  - {name} [{}] {desc}{note}", attrs.join(", ")));
        }
    }

    lines.push("\nDataset keys and EXACT field structure:".to_string());
    for (key, value) in dataset {
        let described = metadata
            .dataset_keys
            .get(key)
            .map(|d| format!(" — {d}"))
            .unwrap_or_default();
        lines.push(format!("  - {key}: {}{described}", describe_shape(value, 2)));
    }

    lines.join("\n")
}

fn render_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compact one-line shape description showing inner field names
fn describe_shape(value: &Value, depth: usize) -> String {
    match value {
        Value::Object(map) => {
            if depth == 0 {
                return format!("object({} keys)", map.len());
            }
            // Homogeneous maps (key → stats record) are described by their
            // first entry's field names
            if let Some((_, first)) = map.iter().next() {
                if map.len() > 3 && map.values().all(|v| same_shape(v, first)) {
                    return format!(
                        "object of {} entries, each {}",
                        map.len(),
                        describe_shape(first, depth - 1)
                    );
                }
            }
            let fields: Vec<String> = map
                .iter()
                .take(12)
                .map(|(k, v)| format!("{k}: {}", describe_shape(v, depth - 1)))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
        Value::Array(items) => match items.first() {
            None => "empty list".to_string(),
            Some(first) => format!(
                "list of {} items, each {}",
                items.len(),
                describe_shape(first, depth.saturating_sub(1))
            ),
        },
        Value::String(_) => "str".to_string(),
        Value::Number(n) => {
            if n.is_i64() {
                "int".to_string()
            } else {
                "float".to_string()
            }
        }
        Value::Bool(_) => "bool".to_string(),
        Value::Null => "null".to_string(),
    }
}

fn same_shape(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.keys().zip(y.keys()).all(|(k1, k2)| k1 == k2)
        }
        (Value::Array(_), Value::Array(_)) => true,
        (Value::Number(_), Value::Number(_)) => true,
        (Value::String(_), Value::String(_)) => true,
        (Value::Bool(_), Value::Bool(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DifficultyLevel;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn dataset() -> Dataset {
        json!({
            "category_stats": {
                "grocery": {"count": 10, "total_amt": 100.0, "fraud_count": 1},
                "travel": {"count": 5, "total_amt": 900.0, "fraud_count": 2},
                "retail": {"count": 7, "total_amt": 50.0, "fraud_count": 0},
                "fuel": {"count": 3, "total_amt": 30.0, "fraud_count": 0}
            },
            "total": 42
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn metadata() -> Metadata {
        serde_json::from_value(json!({
            "description": "Card transactions",
            "domain": "finance",
            "columns": {
                "cc_num": {"type": "string", "sensitivity": "pii"},
                "amount": {"type": "float", "nullable": true, "null_rate": 0.02}
            },
            "dataset_keys": {"category_stats": "per-category aggregates"},
            "important_notes": ["fraud_count is already aggregated"]
        }))
        .unwrap()
    }

    fn question() -> Question {
        Question {
            id: "q_01".into(),
            text: "Which category has the highest fraud rate?".into(),
            difficulty_rank: 3,
            difficulty_level: DifficultyLevel::Easy,
            reasoning: String::new(),
            relevant_data_keys: vec!["category_stats".into()],
        }
    }

    #[test]
    fn schema_summary_names_exact_fields_and_flags() {
        let summary = build_schema_summary(&dataset(), &metadata());
        assert!(summary.contains("fraud_count"));
        assert!(summary.contains("PII"));
        assert!(summary.contains("IMPORTANT NOTES"));
        assert!(summary.contains("per-category aggregates"));
        // Homogeneous map collapses to a single entry shape
        assert!(summary.contains("object of 4 entries"));
    }

    #[test]
    fn question_system_prompt_carries_count_and_buckets() {
        let system = question_gen_system(10);
        assert!(system.contains("exactly 10 questions"));
        assert!(system.contains("ranks 1-4"));
        assert!(system.contains("PII"));
    }

    #[test]
    fn first_iteration_prompt_has_no_feedback_section() {
        let prompt = build_dag_prompt(&question(), &dataset(), &metadata(), None);
        assert!(prompt.contains("Which category"));
        assert!(!prompt.contains("PREVIOUS ATTEMPT"));
    }

    #[test]
    fn retry_prompt_embeds_previous_dag_and_feedback() {
        let dag = GeneratedDag::empty("q_01", "first try");
        let feedback = CriticFeedback {
            is_approved: false,
            overall_reasoning: "DAG has no nodes".into(),
            layer_validations: vec![],
            specific_errors: vec!["DAG has no nodes".into()],
            suggestions: vec!["Add at least one node".into()],
        };
        let prompt = build_dag_prompt(&question(), &dataset(), &metadata(), Some((&dag, &feedback)));
        assert!(prompt.contains("PREVIOUS ATTEMPT REJECTED"));
        assert!(prompt.contains("COMPLETE replacement"));
        assert!(prompt.contains("Add at least one node"));
        assert!(prompt.contains("\"question_id\": \"q_01\""));
    }

    #[test]
    fn critic_prompt_includes_full_code_of_layer_only() {
        let node_a = DagNode {
            node_id: "a".into(),
            operation: "extract".into(),
            function_name: "f_a".into(),
            inputs: BTreeMap::from([("x".to_string(), "dataset.total".to_string())]),
            expected_output_type: "int".into(),
            layer: 0,
            code: "def f_a(x):\n    return x".into(),
        };
        let node_b = DagNode {
            node_id: "b".into(),
            operation: "double".into(),
            function_name: "f_b".into(),
            inputs: BTreeMap::from([("x".to_string(), "prev_node.a.output".to_string())]),
            expected_output_type: "int".into(),
            layer: 1,
            code: "def f_b(x):\n    return x * 2".into(),
        };
        let dag = GeneratedDag {
            question_id: "q_01".into(),
            description: "double total".into(),
            nodes: vec![node_a, node_b.clone()],
            edges: vec![],
            final_answer_node: "b".into(),
        };
        let summary = build_validated_layers_summary(&dag, 1);
        assert!(summary.contains("f_a(x) -> int"));

        let prompt = build_critic_layer_prompt(
            &question(),
            &dag,
            1,
            &[&node_b],
            &summary,
            &dataset(),
            &metadata(),
        );
        assert!(prompt.contains("def f_b"));
        // upstream layer appears only as a signature, not as code
        assert!(!prompt.contains("def f_a(x):\n    return x"));
    }
}
