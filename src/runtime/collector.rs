//! Result collector - merges per-question outcomes into the final report
//!
//! The accumulators are commutative: traces arrive in completion order and
//! the report sorts by difficulty rank, so the output is identical whatever
//! the fan-out interleaving was.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::info;

use crate::model::{
    DifficultyStats, ExecutionResult, Question, QuestionTrace, RunReport, RunSummary,
};

/// Order-independent run-state accumulators
#[derive(Default)]
pub struct RunAccumulators {
    pub completed_results: Vec<ExecutionResult>,
    pub failed_question_ids: Vec<String>,
    pub question_traces: Vec<QuestionTrace>,
}

impl RunAccumulators {
    /// Merge one question's outcome; commutative with respect to call order.
    ///
    /// A question lands in `completed_results` iff execution succeeded;
    /// everything else (execution failure or loop exhaustion) lands in
    /// `failed_question_ids`.
    pub fn merge(&mut self, trace: QuestionTrace) {
        match &trace.execution_result {
            Some(result) if result.success => {
                self.completed_results.push(result.clone());
            }
            _ => {
                self.failed_question_ids.push(trace.question.id.clone());
            }
        }
        self.question_traces.push(trace);
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Assemble the final report from the accumulated run state.
pub fn build_report(
    questions: &[Question],
    mut acc: RunAccumulators,
    dataset_name: &str,
) -> RunReport {
    // Deterministic output regardless of completion interleaving
    acc.question_traces
        .sort_by_key(|t| t.question.difficulty_rank);

    let total = questions.len() as u32;
    let passed = acc.completed_results.len() as u32;
    let failed = acc.failed_question_ids.len() as u32;

    let pass_rate = if total > 0 {
        round4(passed as f64 / total as f64)
    } else {
        0.0
    };

    let avg_execution_time_ms = if acc.completed_results.is_empty() {
        0.0
    } else {
        let sum: f64 = acc
            .completed_results
            .iter()
            .map(|r| r.execution_time_ms)
            .sum();
        round4(sum / acc.completed_results.len() as f64)
    };

    let total_iterations = acc
        .question_traces
        .iter()
        .map(|t| t.total_iterations)
        .sum();

    let mut difficulty_breakdown: BTreeMap<String, DifficultyStats> = BTreeMap::new();
    for level in ["easy", "medium", "hard"] {
        difficulty_breakdown.insert(level.to_string(), DifficultyStats::default());
    }
    for trace in &acc.question_traces {
        let entry = difficulty_breakdown
            .entry(trace.question.difficulty_level.as_str().to_string())
            .or_default();
        entry.total += 1;
        if trace.passed() {
            entry.passed += 1;
        } else {
            entry.failed += 1;
        }
    }
    for stats in difficulty_breakdown.values_mut() {
        stats.pass_rate = if stats.total > 0 {
            round4(stats.passed as f64 / stats.total as f64)
        } else {
            0.0
        };
    }

    info!(
        total,
        passed,
        failed,
        pass_rate,
        "report assembled"
    );

    RunReport {
        summary: RunSummary {
            total,
            passed,
            failed,
            pass_rate,
            avg_execution_time_ms,
            total_iterations,
            timestamp: Utc::now().to_rfc3339(),
            dataset_name: dataset_name.to_string(),
        },
        difficulty_breakdown,
        question_traces: acc.question_traces,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DifficultyLevel;
    use serde_json::json;

    fn question(id: &str, rank: u32, level: DifficultyLevel) -> Question {
        Question {
            id: id.into(),
            text: format!("question {id}"),
            difficulty_rank: rank,
            difficulty_level: level,
            reasoning: String::new(),
            relevant_data_keys: vec![],
        }
    }

    fn trace(q: Question, success: Option<bool>, iterations: u32, time_ms: f64) -> QuestionTrace {
        let execution_result = success.map(|s| ExecutionResult {
            question_id: q.id.clone(),
            success: s,
            final_answer: s.then(|| json!(1)),
            node_results: vec![],
            node_outputs: Default::default(),
            error: (!s).then(|| "boom".to_string()),
            execution_time_ms: time_ms,
        });
        QuestionTrace {
            question: q,
            dag_history: vec![],
            feedback_history: vec![],
            execution_result,
            total_iterations: iterations,
            conversation: vec![],
        }
    }

    fn three_question_accumulators(order: &[usize]) -> (Vec<Question>, RunAccumulators) {
        let questions = vec![
            question("q_01", 1, DifficultyLevel::Easy),
            question("q_02", 2, DifficultyLevel::Medium),
            question("q_03", 3, DifficultyLevel::Hard),
        ];
        let traces = [
            trace(questions[0].clone(), Some(true), 1, 10.0),
            trace(questions[1].clone(), Some(false), 2, 5.0),
            trace(questions[2].clone(), None, 3, 0.0),
        ];
        let mut acc = RunAccumulators::default();
        for &i in order {
            acc.merge(traces[i].clone());
        }
        (questions, acc)
    }

    #[test]
    fn counts_partition_the_question_set() {
        let (questions, acc) = three_question_accumulators(&[0, 1, 2]);
        // |completed| + |failed| = |questions|
        assert_eq!(
            acc.completed_results.len() + acc.failed_question_ids.len(),
            questions.len()
        );
        let report = build_report(&questions, acc, "sample");
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.pass_rate, round4(1.0 / 3.0));
        assert_eq!(report.summary.total_iterations, 6);
        // avg over the single successful execution
        assert_eq!(report.summary.avg_execution_time_ms, 10.0);
    }

    #[test]
    fn execution_failure_and_exhaustion_both_count_as_failed() {
        let (_, acc) = three_question_accumulators(&[0, 1, 2]);
        assert_eq!(acc.failed_question_ids, vec!["q_02", "q_03"]);
    }

    #[test]
    fn report_is_independent_of_merge_order() {
        let (questions, acc_a) = three_question_accumulators(&[0, 1, 2]);
        let (_, acc_b) = three_question_accumulators(&[2, 0, 1]);

        let mut report_a = build_report(&questions, acc_a, "sample");
        let mut report_b = build_report(&questions, acc_b, "sample");
        // timestamps differ; everything else must be identical
        report_a.summary.timestamp = String::new();
        report_b.summary.timestamp = String::new();
        assert_eq!(report_a, report_b);

        let ids: Vec<&str> = report_a
            .question_traces
            .iter()
            .map(|t| t.question.id.as_str())
            .collect();
        assert_eq!(ids, vec!["q_01", "q_02", "q_03"]);
    }

    #[test]
    fn difficulty_breakdown_has_all_buckets() {
        let (questions, acc) = three_question_accumulators(&[1, 2, 0]);
        let report = build_report(&questions, acc, "sample");
        assert_eq!(report.difficulty_breakdown.len(), 3);
        assert_eq!(report.difficulty_breakdown["easy"].passed, 1);
        assert_eq!(report.difficulty_breakdown["medium"].failed, 1);
        assert_eq!(report.difficulty_breakdown["hard"].failed, 1);
        assert_eq!(report.difficulty_breakdown["easy"].pass_rate, 1.0);
    }

    #[test]
    fn empty_run_produces_zeroed_summary() {
        let report = build_report(&[], RunAccumulators::default(), "empty");
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.summary.pass_rate, 0.0);
        assert_eq!(report.summary.avg_execution_time_ms, 0.0);
    }
}
