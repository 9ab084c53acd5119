//! Orchestrator - ingest gate, question generation, fan-out, aggregation
//!
//! One run: validate inputs → generate questions → dispatch one independent
//! critic loop per question (capped concurrency) → merge outcomes → build
//! the report. Questions share only read-only `Arc`s of the dataset and
//! metadata; every loop owns its mutable history, so merging is a plain
//! commutative append.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::config::ProbeConfig;
use crate::dataset::{validate_dataset, Dataset, Metadata};
use crate::error::{ProbeError, Result};
use crate::event::{EventKind, QuestionBrief, RunStream, SummaryBrief};
use crate::llm::{LlmClient, RetryPolicy};
use crate::model::{DifficultyLevel, Question, QuestionTrace, RunReport};

use super::collector::{build_report, RunAccumulators};
use super::critic_loop::CriticLoop;
use super::question_gen::QuestionGenerator;

/// Difficulty filter applied to generated questions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DifficultyFilter {
    #[default]
    All,
    Only(DifficultyLevel),
}

impl DifficultyFilter {
    pub fn matches(&self, level: DifficultyLevel) -> bool {
        match self {
            Self::All => true,
            Self::Only(want) => *want == level,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Only(level) => level.as_str(),
        }
    }
}

impl std::str::FromStr for DifficultyFilter {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            other => other
                .parse::<DifficultyLevel>()
                .map(Self::Only)
                .map_err(|_| ProbeError::InvalidRunConfig {
                    reason: format!(
                        "difficulty must be one of: easy, medium, hard, all (got '{other}')"
                    ),
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub num_questions: usize,
    pub difficulty: DifficultyFilter,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            num_questions: 10,
            difficulty: DifficultyFilter::All,
        }
    }
}

pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    config: ProbeConfig,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, config: ProbeConfig) -> Self {
        Self {
            llm,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute the full pipeline and return the assembled report.
    ///
    /// All lifecycle events except the terminal one are published here; the
    /// caller persists the report and publishes `run_complete` / `error`.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn run(
        &self,
        run_id: &str,
        dataset: Arc<Dataset>,
        metadata: Option<Arc<Metadata>>,
        opts: &RunOptions,
        stream: &RunStream,
        cancelled: &Arc<AtomicBool>,
        dataset_name: &str,
    ) -> Result<RunReport> {
        // ── Ingest gate: fatal before any LLM call ────────────────────
        validate_dataset(&dataset)?;
        if opts.num_questions == 0 {
            return Err(ProbeError::InvalidRunConfig {
                reason: "num_questions must be at least 1".to_string(),
            });
        }

        let mut warnings = Vec::new();
        let metadata = match metadata {
            Some(m) => m,
            None => {
                warn!("metadata document missing; continuing with an empty schema");
                warnings.push(
                    "metadata document missing; prompts use an empty schema".to_string(),
                );
                Arc::new(Metadata::default())
            }
        };

        stream.publish(EventKind::RunStarted {
            run_id: run_id.to_string(),
            num_questions: opts.num_questions,
            difficulty: opts.difficulty.as_str().to_string(),
            warnings,
        });

        // ── Question generation ───────────────────────────────────────
        let gen_config = ProbeConfig {
            question_count: opts.num_questions,
            ..self.config.clone()
        };
        let generator =
            QuestionGenerator::new(Arc::clone(&self.llm), gen_config, self.retry.clone());
        let mut questions = generator.generate(&dataset, &metadata).await?;

        questions.retain(|q| opts.difficulty.matches(q.difficulty_level));
        questions.truncate(opts.num_questions);
        if questions.is_empty() {
            return Err(ProbeError::NoQuestions);
        }

        stream.publish(EventKind::QuestionsGenerated {
            count: questions.len(),
            questions: questions
                .iter()
                .map(|q| QuestionBrief {
                    id: q.id.clone(),
                    text: q.text.clone(),
                    difficulty_level: q.difficulty_level.as_str().to_string(),
                    difficulty_rank: q.difficulty_rank,
                })
                .collect(),
        });

        // ── Fan-out: one critic loop per question ─────────────────────
        info!(count = questions.len(), "fanning out critic loops");
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut join_set: JoinSet<QuestionTrace> = JoinSet::new();

        for question in questions.clone() {
            let semaphore = Arc::clone(&semaphore);
            let llm = Arc::clone(&self.llm);
            let config = self.config.clone();
            let retry = self.retry.clone();
            let dataset = Arc::clone(&dataset);
            let metadata = Arc::clone(&metadata);
            let stream = stream.clone();
            let cancelled = Arc::clone(cancelled);

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closes");
                let critic_loop = CriticLoop::new(llm, config, retry);
                critic_loop
                    .run(question, &dataset, &metadata, &stream, &cancelled)
                    .await
            });
        }

        // ── Aggregation: commutative merge ────────────────────────────
        let mut acc = RunAccumulators::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(trace) => acc.merge(trace),
                Err(e) => {
                    // Internal failure of one question; the others continue.
                    error!(error = %e, "critic loop task failed");
                }
            }
        }

        // Questions whose task died still count as failed, keeping
        // |completed| + |failed| = |questions|.
        for question in &questions {
            let seen = acc
                .question_traces
                .iter()
                .any(|t| t.question.id == question.id);
            if !seen {
                acc.merge(QuestionTrace {
                    question: question.clone(),
                    dag_history: vec![],
                    feedback_history: vec![],
                    execution_result: None,
                    total_iterations: 0,
                    conversation: vec![],
                });
            }
        }

        if cancelled.load(Ordering::SeqCst) {
            return Err(ProbeError::RunCancelled {
                run_id: run_id.to_string(),
            });
        }

        Ok(build_report(&questions, acc, dataset_name))
    }

    /// Run the pipeline, persist the report, and publish the terminal event.
    pub async fn run_to_file(
        &self,
        run_id: &str,
        dataset: Arc<Dataset>,
        metadata: Option<Arc<Metadata>>,
        opts: &RunOptions,
        stream: &RunStream,
        cancelled: &Arc<AtomicBool>,
        dataset_name: &str,
        output_path: &Path,
    ) -> Result<RunReport> {
        let outcome = self
            .run(
                run_id,
                dataset,
                metadata,
                opts,
                stream,
                cancelled,
                dataset_name,
            )
            .await;

        match outcome {
            Ok(report) => {
                let rendered = serde_json::to_string_pretty(&report)?;
                std::fs::write(output_path, rendered)?;
                let file_name = output_path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| output_path.display().to_string());
                info!(file = %file_name, "report written");

                stream.publish(EventKind::RunComplete {
                    output_file: file_name,
                    summary: SummaryBrief {
                        total: report.summary.total,
                        passed: report.summary.passed,
                        failed: report.summary.failed,
                        pass_rate: report.summary.pass_rate,
                    },
                });
                Ok(report)
            }
            Err(e) => {
                stream.publish(EventKind::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_filter_parses_and_matches() {
        let all: DifficultyFilter = "all".parse().unwrap();
        assert!(all.matches(DifficultyLevel::Hard));

        let easy: DifficultyFilter = "easy".parse().unwrap();
        assert!(easy.matches(DifficultyLevel::Easy));
        assert!(!easy.matches(DifficultyLevel::Hard));

        let err = "extreme".parse::<DifficultyFilter>().unwrap_err();
        assert_eq!(err.code(), "PROBE-005");
        assert_eq!(err.exit_code(), 1);
    }
}
