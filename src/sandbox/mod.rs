//! Sandbox - restricted execution of LLM-authored node code
//!
//! The node `code` field holds a single function definition in a Python-like
//! surface language. This module owns the whole pipeline for it:
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`token`] | Lexing with INDENT/DEDENT synthesis |
//! | [`ast`] | Statement/expression tree with source lines |
//! | [`parser`] | Recursive-descent parsing |
//! | [`scan`] | AST safety scan (imports, dunders, forbidden calls) |
//! | [`value`] | Runtime values and JSON conversion |
//! | [`interp`] | Tree-walking evaluator with a wall-clock deadline |
//! | [`builtins`] | The allowlisted environment |
//!
//! There is no embedded Python runtime anywhere: everything the node code
//! can touch is defined in this crate, which is what makes the allowlist
//! enforceable.

pub mod ast;
pub mod builtins;
pub mod interp;
pub mod parser;
pub mod scan;
pub mod token;
pub mod value;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value as Json;
use tracing::debug;

use crate::model::{DagNode, NodeExecutionResult};

pub use parser::parse_module;
pub use scan::scan_code;

/// Parse failure with a 1-based source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub line: u32,
    pub message: String,
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyntaxError at line {}: {}", self.line, self.message)
    }
}

/// Check that `code` parses as exactly one function definition whose name
/// matches `expected_name`. The error string is critic-ready.
pub fn check_function(code: &str, expected_name: &str) -> Result<(), String> {
    let module = parse_module(code).map_err(|e| e.to_string())?;

    let mut funcs = module.body.iter().filter_map(|stmt| match stmt {
        ast::Stmt::FuncDef { name, .. } => Some(name.as_str()),
        _ => None,
    });

    let Some(first) = funcs.next() else {
        return Err("code does not define a function".to_string());
    };
    if module.body.len() != 1 {
        return Err("code must contain exactly one top-level function definition".to_string());
    }
    if first != expected_name {
        return Err(format!(
            "function is named '{first}' but function_name declares '{expected_name}'"
        ));
    }
    Ok(())
}

/// Execute one node's function in a fresh restricted namespace.
///
/// Steps: re-run the safety scan, evaluate the function definition, call it
/// with `resolved_inputs` matched against its declared parameters, and
/// convert the result to JSON. Only the call itself is timed. The namespace
/// is dropped afterwards; nothing leaks between nodes.
pub fn execute_node(
    node: &DagNode,
    resolved_inputs: &BTreeMap<String, Json>,
    timeout: Duration,
) -> NodeExecutionResult {
    let fail = |error: String, elapsed_ms: f64| NodeExecutionResult {
        node_id: node.node_id.clone(),
        success: false,
        output: None,
        error: Some(error),
        execution_time_ms: elapsed_ms,
    };

    // Safety scan runs again even though the critic already did: execution
    // must stay safe if a caller wires an unreviewed DAG straight in.
    let issues = scan_code(&node.code);
    if !issues.is_empty() {
        return fail(format!("SafetyViolation: {}", issues.join("; ")), 0.0);
    }

    let module = match parse_module(&node.code) {
        Ok(m) => m,
        Err(e) => return fail(e.to_string(), 0.0),
    };

    let deadline = Instant::now() + timeout;
    let mut interp = interp::Interp::new(Some(deadline));

    if let Err(flow) = interp.exec_stmts(&module.body) {
        return fail(render_flow(flow, timeout), 0.0);
    }

    let Some(func) = interp.module_binding(&node.function_name) else {
        return fail(
            format!("NameError: function '{}' is not defined", node.function_name),
            0.0,
        );
    };

    let kwargs: Vec<(String, value::Value)> = resolved_inputs
        .iter()
        .map(|(k, v)| (k.clone(), value::from_json(v)))
        .collect();

    debug!(node_id = %node.node_id, params = kwargs.len(), "sandbox call");

    let started = Instant::now();
    let outcome = interp.call_value(func, Vec::new(), kwargs);
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(result) => match value::to_json(&result) {
            Ok(json) => NodeExecutionResult {
                node_id: node.node_id.clone(),
                success: true,
                output: Some(json),
                error: None,
                execution_time_ms: elapsed_ms,
            },
            Err(msg) => fail(format!("TypeError: {msg}"), elapsed_ms),
        },
        Err(flow) => fail(render_flow(flow, timeout), elapsed_ms),
    }
}

fn render_flow(flow: interp::Flow, timeout: Duration) -> String {
    match flow {
        interp::Flow::Raise(exc) => exc.render(),
        interp::Flow::Timeout => format!(
            "TimeoutError: node execution exceeded {}s",
            timeout.as_secs_f64()
        ),
        interp::Flow::Return(_) => "SyntaxError: 'return' outside function".to_string(),
        interp::Flow::Break | interp::Flow::Continue => {
            "SyntaxError: 'break' or 'continue' outside loop".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(code: &str, function_name: &str) -> DagNode {
        DagNode {
            node_id: "n1".into(),
            operation: String::new(),
            function_name: function_name.into(),
            inputs: BTreeMap::new(),
            expected_output_type: String::new(),
            layer: 0,
            code: code.into(),
        }
    }

    fn run(code: &str, func: &str, inputs: &[(&str, Json)]) -> NodeExecutionResult {
        let inputs: BTreeMap<String, Json> = inputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        execute_node(&node(code, func), &inputs, Duration::from_secs(5))
    }

    // ═══════════════════════════════════════════════════════════════
    // check_function
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn check_function_accepts_matching_def() {
        assert!(check_function("def ret(x):\n    return x\n", "ret").is_ok());
    }

    #[test]
    fn check_function_rejects_name_mismatch() {
        let err = check_function("def other(x):\n    return x\n", "ret").unwrap_err();
        assert!(err.contains("other"));
        assert!(err.contains("ret"));
    }

    #[test]
    fn check_function_rejects_extra_statements() {
        let err = check_function("x = 1\ndef ret(x):\n    return x\n", "ret").unwrap_err();
        assert!(err.contains("exactly one"));
    }

    #[test]
    fn check_function_rejects_syntax_error() {
        let err = check_function("def ret(x:\n    return x\n", "ret").unwrap_err();
        assert!(err.contains("SyntaxError"));
    }

    // ═══════════════════════════════════════════════════════════════
    // execute_node basics
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn identity_function_returns_input() {
        let result = run("def ret(x): return x", "ret", &[("x", json!(42))]);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!(42)));
        assert!(result.execution_time_ms >= 0.0);
    }

    #[test]
    fn computes_aggregate_over_rows() {
        let code = "def avg_amount(rows):\n    amounts = [r['amount'] for r in rows]\n    return sum(amounts) / len(amounts)\n";
        let rows = json!([{"amount": 10.0}, {"amount": 30.0}]);
        let result = run(code, "avg_amount", &[("rows", rows)]);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!(20.0)));
    }

    #[test]
    fn missing_argument_is_type_error() {
        let result = run("def f(a, b): return a + b", "f", &[("a", json!(1))]);
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("TypeError"));
        assert!(result.error.as_ref().unwrap().contains("b"));
    }

    #[test]
    fn unexpected_argument_is_type_error() {
        let result = run(
            "def f(a): return a",
            "f",
            &[("a", json!(1)), ("ghost", json!(2))],
        );
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("ghost"));
    }

    #[test]
    fn exception_is_reported_as_class_and_message() {
        let result = run("def f(x): return 1 / x", "f", &[("x", json!(0))]);
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("ZeroDivisionError:"), "got {error}");
    }

    #[test]
    fn unsafe_code_is_rejected_before_running() {
        let result = run("def f(x):\n    import os\n    return 1", "f", &[("x", json!(1))]);
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("SafetyViolation"));
        assert!(error.contains("import"));
    }

    #[test]
    fn infinite_loop_hits_deadline() {
        let inputs = BTreeMap::new();
        let result = execute_node(
            &node("def spin():\n    while True:\n        pass\n", "spin"),
            &inputs,
            Duration::from_millis(50),
        );
        assert!(!result.success);
        assert!(result.error.unwrap().contains("TimeoutError"));
    }

    #[test]
    fn timeout_is_not_catchable_by_node_code() {
        let code = "def spin():\n    try:\n        while True:\n            pass\n    except Exception:\n        return 'caught'\n";
        let inputs = BTreeMap::new();
        let result = execute_node(&node(code, "spin"), &inputs, Duration::from_millis(50));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("TimeoutError"));
    }

    #[test]
    fn namespace_is_fresh_per_call() {
        // A global-ish binding from one call must not leak into the next
        let code = "def f(x):\n    marker = x\n    return marker\n";
        let r1 = run(code, "f", &[("x", json!(1))]);
        assert!(r1.success);
        let code2 = "def g(y):\n    return marker\n";
        let r2 = run(code2, "g", &[("y", json!(2))]);
        assert!(!r2.success);
        assert!(r2.error.unwrap().contains("NameError"));
    }

    // ═══════════════════════════════════════════════════════════════
    // Language coverage smoke tests
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn dict_comprehension_and_sorted() {
        let code = "def top(stats):\n    rates = {k: v['fraud'] / v['count'] for k, v in stats.items()}\n    ranked = sorted(rates.items(), key=lambda kv: kv[1], reverse=True)\n    return ranked[0][0]\n";
        let stats = json!({
            "grocery": {"count": 100, "fraud": 2},
            "travel": {"count": 50, "fraud": 5}
        });
        let result = run(code, "top", &[("stats", stats)]);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!("travel")));
    }

    #[test]
    fn counter_and_most_common() {
        let code = "def busiest(cats):\n    counts = Counter(cats)\n    return counts.most_common(1)[0][0]\n";
        let cats = json!(["a", "b", "a", "c", "a", "b"]);
        let result = run(code, "busiest", &[("cats", cats)]);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!("a")));
    }

    #[test]
    fn try_except_catches_key_error() {
        let code = "def lookup(d):\n    try:\n        return d['missing']\n    except KeyError:\n        return 'absent'\n";
        let result = run(code, "lookup", &[("d", json!({"present": 1}))]);
        assert!(result.success);
        assert_eq!(result.output, Some(json!("absent")));
    }

    #[test]
    fn datetime_strptime_and_arithmetic() {
        let code = "def span_days(a, b):\n    start = datetime.strptime(a, '%Y-%m-%d')\n    end = datetime.strptime(b, '%Y-%m-%d')\n    return (end - start).days\n";
        let result = run(
            code,
            "span_days",
            &[("a", json!("2024-01-01")), ("b", json!("2024-03-01"))],
        );
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!(60)));
    }

    #[test]
    fn seeded_random_is_deterministic() {
        let code = "def pick(xs):\n    random.seed(7)\n    return random.choice(xs)\n";
        let xs = json!([1, 2, 3, 4, 5, 6, 7, 8]);
        let r1 = run(code, "pick", &[("xs", xs.clone())]);
        let r2 = run(code, "pick", &[("xs", xs)]);
        assert!(r1.success && r2.success);
        assert_eq!(r1.output, r2.output);
    }

    #[test]
    fn fstring_formatting() {
        let code = "def label(rate):\n    return f\"fraud rate: {rate:.2f}%\"\n";
        let result = run(code, "label", &[("rate", json!(1.2345))]);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!("fraud rate: 1.23%")));
    }

    #[test]
    fn default_parameter_values_apply() {
        let code = "def topn(xs, n=2):\n    return sorted(xs, reverse=True)[:n]\n";
        let result = run(code, "topn", &[("xs", json!([3, 1, 4, 1, 5]))]);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!([5, 4])));
    }
}
