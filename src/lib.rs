//! Tabprobe - LLM evaluation through self-authored computation DAGs
//!
//! Given a tabular dataset bundle (pre-aggregated summaries plus a
//! representative sample) and its schema metadata, tabprobe measures how
//! well an LLM answers structured analytical questions by having it author,
//! repair, and execute small computation graphs:
//!
//! 1. One LLM call elicits a ranked set of questions.
//! 2. Per question, an LLM designs a DAG of small functions that jointly
//!    compute the answer.
//! 3. A two-phase critic (deterministic structural validation, then
//!    layer-by-layer semantic review) approves or rejects the DAG with
//!    actionable feedback, looping up to a bounded number of iterations.
//! 4. Approved DAGs run inside a locked-down interpreter with an
//!    allowlisted environment and an AST safety scan.
//! 5. Per-question traces aggregate into a run report.
//!
//! ## Module architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DOMAIN MODEL                          │
//! │  model     Questions, DAGs, feedback, results, reports       │
//! │  dataset   Bundle + metadata loading, ingest gate            │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      APPLICATION LAYER                       │
//! │  runtime   Question gen, builder, critic, loop, orchestrator │
//! │  dag       Topology, layering, references, validation        │
//! │  sandbox   Lexer → parser → safety scan → interpreter        │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    INFRASTRUCTURE LAYER                      │
//! │  llm       Provider abstraction, the one retry layer         │
//! │  event     Per-run streams + registry                        │
//! │  server    axum API with SSE                                 │
//! │  report    HTML rendering                                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`model`] | Serializable value types; cross-links by string id only |
//! | [`dataset`] | Bundle/metadata loading and the ingest gate |
//! | [`dag`] | Structural analysis and validation of generated DAGs |
//! | [`sandbox`] | Restricted execution of LLM-authored node code |
//! | [`llm`] | Providers, retry/backoff, JSON-object parsing |
//! | [`runtime`] | The pipeline: generator → critic loop → collector |
//! | [`event`] | Ordered single-consumer run event streams |
//! | [`server`] | HTTP boundary (`POST /run`, SSE events, results) |
//! | [`report`] | HTML report rendering |
//! | [`config`] | File + env configuration |
//! | [`error`] | Error types with codes and fix suggestions |

// ═══════════════════════════════════════════════════════════════
// DOMAIN MODEL
// ═══════════════════════════════════════════════════════════════
pub mod dataset;
pub mod model;

// ═══════════════════════════════════════════════════════════════
// APPLICATION LAYER
// ═══════════════════════════════════════════════════════════════
pub mod dag;
pub mod runtime;
pub mod sandbox;

// ═══════════════════════════════════════════════════════════════
// INFRASTRUCTURE LAYER
// ═══════════════════════════════════════════════════════════════
pub mod event;
pub mod llm;
pub mod report;
pub mod server;

// ═══════════════════════════════════════════════════════════════
// CROSS-CUTTING
// ═══════════════════════════════════════════════════════════════
pub mod config;
pub mod error;

// Error types
pub use error::{FixSuggestion, ProbeError, Result};

// Config types
pub use config::{mask_api_key, FileConfig, ProbeConfig};

// Domain model
pub use model::{
    CriticFeedback, DagEdge, DagNode, DifficultyLevel, ExecutionResult, GeneratedDag,
    LayerValidation, NodeExecutionResult, Question, QuestionTrace, RunReport, RunSummary,
    TraceMessage, TraceRole,
};

// Runtime
pub use runtime::{
    execute_dag, CriticLoop, DagBuilder, DifficultyFilter, Orchestrator, QuestionGenerator,
    RunOptions,
};

// Events
pub use event::{EventKind, RunEvent, RunHandle, RunRegistry, RunStatus, RunStream};

// LLM
pub use llm::{create_client, ChatRequest, LlmClient, LlmError, MockClient, RetryPolicy};
