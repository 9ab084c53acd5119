//! Tabprobe error types with error codes
//!
//! Error code ranges:
//! - PROBE-000-009: Input validation errors (dataset, metadata)
//! - PROBE-010-019: Question generation errors
//! - PROBE-020-029: DAG structure errors
//! - PROBE-030-039: LLM provider errors
//! - PROBE-050-059: Run / registry errors
//! - PROBE-060-069: Report errors
//! - PROBE-070-079: Config errors
//! - PROBE-090-099: IO / JSON errors
//! - PROBE-100-109: Internal invariant violations

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
///
/// Implements both `thiserror::Error` for std error compatibility
/// and `miette::Diagnostic` for fancy terminal error display.
#[derive(Error, Debug, Diagnostic)]
pub enum ProbeError {
    // ═══════════════════════════════════════════
    // INPUT VALIDATION ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[PROBE-001] Dataset file not found: {path}")]
    #[diagnostic(code(tabprobe::dataset_not_found), help("Check the file path exists"))]
    DatasetNotFound { path: String },

    #[error("[PROBE-002] Dataset is empty — provide at least one non-empty key")]
    #[diagnostic(
        code(tabprobe::empty_dataset),
        help("The dataset bundle must be a JSON object with at least one non-empty key")
    )]
    EmptyDataset,

    #[error("[PROBE-003] Dataset is not a JSON object: got {actual}")]
    #[diagnostic(
        code(tabprobe::invalid_dataset),
        help("The dataset bundle must be a top-level JSON object mapping keys to values")
    )]
    InvalidDataset { actual: String },

    #[error("[PROBE-004] Metadata document is malformed: {reason}")]
    #[diagnostic(
        code(tabprobe::invalid_metadata),
        help("Metadata must be a JSON object with description, domain, columns")
    )]
    InvalidMetadata { reason: String },

    #[error("[PROBE-005] Invalid run configuration: {reason}")]
    #[diagnostic(code(tabprobe::invalid_run_config))]
    InvalidRunConfig { reason: String },

    // ═══════════════════════════════════════════
    // QUESTION GENERATION ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[PROBE-010] Question generation failed: {reason}")]
    #[diagnostic(
        code(tabprobe::question_gen_failed),
        help("Check LLM provider availability and the API key")
    )]
    QuestionGenFailed { reason: String },

    #[error("[PROBE-011] Question generator returned no usable questions")]
    #[diagnostic(code(tabprobe::no_questions))]
    NoQuestions,

    // ═══════════════════════════════════════════
    // DAG STRUCTURE ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[PROBE-020] Cycle detected in DAG: {cycle}")]
    #[diagnostic(code(tabprobe::cycle_detected))]
    CycleDetected { cycle: String },

    #[error("[PROBE-021] Node '{node_id}' not found in DAG")]
    #[diagnostic(code(tabprobe::node_not_found))]
    NodeNotFound { node_id: String },

    // ═══════════════════════════════════════════
    // LLM PROVIDER ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[PROBE-030] Provider '{provider}' not configured")]
    #[diagnostic(code(tabprobe::provider_not_configured))]
    ProviderNotConfigured { provider: String },

    #[error("[PROBE-031] Provider API error: {reason}")]
    #[diagnostic(
        code(tabprobe::provider_api_error),
        help("Check API key and provider availability")
    )]
    ProviderApiError { reason: String },

    #[error("[PROBE-032] Missing API key for provider '{provider}'")]
    #[diagnostic(
        code(tabprobe::missing_api_key),
        help("Set the OPENAI_API_KEY environment variable")
    )]
    MissingApiKey { provider: String },

    #[error("[PROBE-033] Provider returned non-conforming JSON: {reason}")]
    #[diagnostic(code(tabprobe::response_parse))]
    ResponseParse { reason: String },

    #[error("[PROBE-034] LLM call exhausted {attempts} attempts: {last_error}")]
    #[diagnostic(code(tabprobe::retry_exhausted))]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("[PROBE-035] LLM call timed out after {timeout_secs}s")]
    #[diagnostic(code(tabprobe::llm_timeout))]
    LlmTimeout { timeout_secs: u64 },

    // ═══════════════════════════════════════════
    // RUN / REGISTRY ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[PROBE-050] Run not found: {run_id}")]
    #[diagnostic(code(tabprobe::run_not_found))]
    RunNotFound { run_id: String },

    #[error("[PROBE-051] Event stream for run '{run_id}' already has a subscriber")]
    #[diagnostic(
        code(tabprobe::stream_claimed),
        help("Each run's event stream is single-consumer; open one stream per run")
    )]
    StreamAlreadyClaimed { run_id: String },

    #[error("[PROBE-052] Run '{run_id}' was cancelled")]
    #[diagnostic(code(tabprobe::run_cancelled))]
    RunCancelled { run_id: String },

    // ═══════════════════════════════════════════
    // REPORT ERRORS (060-069)
    // ═══════════════════════════════════════════
    #[error("[PROBE-060] Results file is not a valid run report: {reason}")]
    #[diagnostic(code(tabprobe::invalid_report))]
    InvalidReport { reason: String },

    // ═══════════════════════════════════════════
    // CONFIG ERRORS (070-079)
    // ═══════════════════════════════════════════
    #[error("[PROBE-070] Config error: {reason}")]
    #[diagnostic(code(tabprobe::config_error))]
    ConfigError { reason: String },

    // ═══════════════════════════════════════════
    // IO / JSON ERRORS (090-099)
    // ═══════════════════════════════════════════
    #[error("[PROBE-090] IO error: {0}")]
    #[diagnostic(code(tabprobe::io_error))]
    Io(#[from] std::io::Error),

    #[error("[PROBE-091] JSON error: {0}")]
    #[diagnostic(code(tabprobe::json_error))]
    Json(#[from] serde_json::Error),

    // ═══════════════════════════════════════════
    // INTERNAL ERRORS (100-109)
    // ═══════════════════════════════════════════
    #[error("[PROBE-100] Internal error: {reason}")]
    #[diagnostic(code(tabprobe::internal))]
    Internal { reason: String },
}

impl ProbeError {
    /// Get the error code (e.g., "PROBE-001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatasetNotFound { .. } => "PROBE-001",
            Self::EmptyDataset => "PROBE-002",
            Self::InvalidDataset { .. } => "PROBE-003",
            Self::InvalidMetadata { .. } => "PROBE-004",
            Self::InvalidRunConfig { .. } => "PROBE-005",
            Self::QuestionGenFailed { .. } => "PROBE-010",
            Self::NoQuestions => "PROBE-011",
            Self::CycleDetected { .. } => "PROBE-020",
            Self::NodeNotFound { .. } => "PROBE-021",
            Self::ProviderNotConfigured { .. } => "PROBE-030",
            Self::ProviderApiError { .. } => "PROBE-031",
            Self::MissingApiKey { .. } => "PROBE-032",
            Self::ResponseParse { .. } => "PROBE-033",
            Self::RetryExhausted { .. } => "PROBE-034",
            Self::LlmTimeout { .. } => "PROBE-035",
            Self::RunNotFound { .. } => "PROBE-050",
            Self::StreamAlreadyClaimed { .. } => "PROBE-051",
            Self::RunCancelled { .. } => "PROBE-052",
            Self::InvalidReport { .. } => "PROBE-060",
            Self::ConfigError { .. } => "PROBE-070",
            Self::Io(_) => "PROBE-090",
            Self::Json(_) => "PROBE-091",
            Self::Internal { .. } => "PROBE-100",
        }
    }

    /// Check if error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ProviderApiError { .. } | Self::ResponseParse { .. } | Self::LlmTimeout { .. }
        )
    }

    /// Exit code for the CLI `run` command
    ///
    /// 1 = validation failure, 2 = LLM unreachable, 3 = internal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DatasetNotFound { .. }
            | Self::EmptyDataset
            | Self::InvalidDataset { .. }
            | Self::InvalidMetadata { .. }
            | Self::InvalidRunConfig { .. }
            | Self::InvalidReport { .. }
            | Self::ConfigError { .. } => 1,
            Self::QuestionGenFailed { .. }
            | Self::ProviderNotConfigured { .. }
            | Self::ProviderApiError { .. }
            | Self::MissingApiKey { .. }
            | Self::ResponseParse { .. }
            | Self::RetryExhausted { .. }
            | Self::LlmTimeout { .. } => 2,
            _ => 3,
        }
    }
}

impl FixSuggestion for ProbeError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            ProbeError::DatasetNotFound { .. } => Some("Check the file path exists"),
            ProbeError::EmptyDataset => {
                Some("Provide a dataset bundle with at least one non-empty key")
            }
            ProbeError::InvalidDataset { .. } => {
                Some("The dataset bundle must be a top-level JSON object")
            }
            ProbeError::InvalidMetadata { .. } => {
                Some("Check metadata JSON against the documented shape")
            }
            ProbeError::InvalidRunConfig { .. } => {
                Some("difficulty must be one of: easy, medium, hard, all")
            }
            ProbeError::QuestionGenFailed { .. } | ProbeError::ProviderApiError { .. } => {
                Some("Check API key and provider availability")
            }
            ProbeError::MissingApiKey { .. } => Some("Set the OPENAI_API_KEY env var"),
            ProbeError::ResponseParse { .. } => {
                Some("The model returned malformed JSON; retrying usually helps")
            }
            ProbeError::RetryExhausted { .. } => {
                Some("Provider kept failing; check network and rate limits")
            }
            ProbeError::StreamAlreadyClaimed { .. } => Some("Open a single event stream per run"),
            ProbeError::RunNotFound { .. } => {
                Some("Verify the run_id; entries are removed after a grace period")
            }
            ProbeError::ConfigError { .. } => {
                Some("Check ~/.config/tabprobe/config.toml for syntax errors")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_extraction() {
        let err = ProbeError::EmptyDataset;
        assert_eq!(err.code(), "PROBE-002");
        let err = ProbeError::RetryExhausted {
            attempts: 3,
            last_error: "429".into(),
        };
        assert_eq!(err.code(), "PROBE-034");
    }

    #[test]
    fn test_error_display_includes_code() {
        let err = ProbeError::CycleDetected {
            cycle: "a → b → a".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("[PROBE-020]"));
        assert!(msg.contains("a → b → a"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(ProbeError::ProviderApiError {
            reason: "503".into()
        }
        .is_recoverable());
        assert!(ProbeError::ResponseParse {
            reason: "bad json".into()
        }
        .is_recoverable());
        assert!(!ProbeError::EmptyDataset.is_recoverable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ProbeError::EmptyDataset.exit_code(), 1);
        assert_eq!(
            ProbeError::RetryExhausted {
                attempts: 3,
                last_error: "timeout".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            ProbeError::Internal {
                reason: "bug".into()
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn test_fix_suggestion_present_for_user_facing_errors() {
        assert!(ProbeError::MissingApiKey {
            provider: "openai".into()
        }
        .fix_suggestion()
        .is_some());
        assert!(ProbeError::Internal {
            reason: "x".into()
        }
        .fix_suggestion()
        .is_none());
    }
}
