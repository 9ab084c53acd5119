//! HTML rendering of a stored run report
//!
//! Deliberately thin: one self-contained page with inline styles, no
//! templating dependency. The browser UI proper lives outside this crate.

use crate::model::{QuestionTrace, RunReport};

pub fn render_html(report: &RunReport) -> String {
    let mut out = String::with_capacity(16 * 1024);
    let s = &report.summary;

    out.push_str(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
<title>tabprobe report</title>\n<style>\n\
body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 960px; color: #1a1a2e; }\n\
h1, h2 { border-bottom: 1px solid #ddd; padding-bottom: .3rem; }\n\
table { border-collapse: collapse; width: 100%; margin: 1rem 0; }\n\
th, td { border: 1px solid #ddd; padding: .45rem .6rem; text-align: left; }\n\
th { background: #f4f4f8; }\n\
.pass { color: #1a7f37; font-weight: 600; }\n\
.fail { color: #b42318; font-weight: 600; }\n\
pre { background: #f6f8fa; padding: .7rem; overflow-x: auto; border-radius: 4px; }\n\
details { margin: .5rem 0; }\n\
summary { cursor: pointer; }\n\
</style>\n</head>\n<body>\n",
    );

    out.push_str(&format!(
        "<h1>Evaluation report — {}</h1>\n<p>{}</p>\n",
        escape(&s.dataset_name),
        escape(&s.timestamp)
    ));

    out.push_str(&format!(
        "<h2>Summary</h2>\n<table>\n<tr><th>Total</th><th>Passed</th><th>Failed</th>\
<th>Pass rate</th><th>Avg execution (ms)</th><th>Total iterations</th></tr>\n\
<tr><td>{}</td><td class=\"pass\">{}</td><td class=\"fail\">{}</td>\
<td>{:.1}%</td><td>{:.2}</td><td>{}</td></tr>\n</table>\n",
        s.total,
        s.passed,
        s.failed,
        s.pass_rate * 100.0,
        s.avg_execution_time_ms,
        s.total_iterations
    ));

    out.push_str("<h2>Difficulty breakdown</h2>\n<table>\n<tr><th>Level</th><th>Total</th><th>Passed</th><th>Failed</th><th>Pass rate</th></tr>\n");
    for level in ["easy", "medium", "hard"] {
        if let Some(stats) = report.difficulty_breakdown.get(level) {
            out.push_str(&format!(
                "<tr><td>{level}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.1}%</td></tr>\n",
                stats.total,
                stats.passed,
                stats.failed,
                stats.pass_rate * 100.0
            ));
        }
    }
    out.push_str("</table>\n");

    out.push_str("<h2>Questions</h2>\n");
    for trace in &report.question_traces {
        render_trace(&mut out, trace);
    }

    out.push_str("</body>\n</html>\n");
    out
}

fn render_trace(out: &mut String, trace: &QuestionTrace) {
    let q = &trace.question;
    let (badge_class, badge) = if trace.passed() {
        ("pass", "PASS")
    } else {
        ("fail", "FAIL")
    };

    out.push_str(&format!(
        "<details>\n<summary><span class=\"{badge_class}\">{badge}</span> \
{} <em>({}, rank {}, {} iteration(s))</em>: {}</summary>\n",
        escape(&q.id),
        q.difficulty_level,
        q.difficulty_rank,
        trace.total_iterations,
        escape(&q.text)
    ));

    match &trace.execution_result {
        Some(result) if result.success => {
            let answer = result
                .final_answer
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string());
            out.push_str(&format!(
                "<p>Final answer: <code>{}</code> ({:.2} ms)</p>\n",
                escape(&answer),
                result.execution_time_ms
            ));
        }
        Some(result) => {
            out.push_str(&format!(
                "<p class=\"fail\">Execution failed: {}</p>\n",
                escape(result.error.as_deref().unwrap_or("unknown error"))
            ));
        }
        None => {
            out.push_str("<p class=\"fail\">Critic loop exhausted without an approved DAG</p>\n");
        }
    }

    for (i, feedback) in trace.feedback_history.iter().enumerate() {
        if feedback.is_approved {
            continue;
        }
        out.push_str(&format!(
            "<p>Iteration {} rejection: {}</p>\n",
            i + 1,
            escape(&feedback.overall_reasoning)
        ));
        if !feedback.specific_errors.is_empty() {
            out.push_str("<ul>\n");
            for err in feedback.specific_errors.iter().take(10) {
                out.push_str(&format!("<li>{}</li>\n", escape(err)));
            }
            out.push_str("</ul>\n");
        }
    }

    if !trace.conversation.is_empty() {
        out.push_str("<pre>");
        for message in &trace.conversation {
            out.push_str(&escape(&message.content));
            out.push('\n');
        }
        out.push_str("</pre>\n");
    }

    out.push_str("</details>\n");
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DifficultyLevel, DifficultyStats, Question, RunSummary};
    use std::collections::BTreeMap;

    fn minimal_report() -> RunReport {
        RunReport {
            summary: RunSummary {
                total: 1,
                passed: 0,
                failed: 1,
                pass_rate: 0.0,
                avg_execution_time_ms: 0.0,
                total_iterations: 3,
                timestamp: "2026-01-01T00:00:00Z".into(),
                dataset_name: "fraud<check>".into(),
            },
            difficulty_breakdown: BTreeMap::from([(
                "easy".to_string(),
                DifficultyStats {
                    total: 1,
                    passed: 0,
                    failed: 1,
                    pass_rate: 0.0,
                },
            )]),
            question_traces: vec![QuestionTrace {
                question: Question {
                    id: "q_01".into(),
                    text: "Is x < y?".into(),
                    difficulty_rank: 1,
                    difficulty_level: DifficultyLevel::Easy,
                    reasoning: String::new(),
                    relevant_data_keys: vec![],
                },
                dag_history: vec![],
                feedback_history: vec![],
                execution_result: None,
                total_iterations: 3,
                conversation: vec![],
            }],
        }
    }

    #[test]
    fn renders_summary_and_escapes_html() {
        let html = render_html(&minimal_report());
        assert!(html.contains("<!DOCTYPE html>"));
        assert!(html.contains("fraud&lt;check&gt;"));
        assert!(html.contains("Is x &lt; y?"));
        assert!(html.contains("FAIL"));
        assert!(html.contains("exhausted"));
    }
}
