//! Per-run event stream
//!
//! An ordered queue with exactly one consumer. Publishers never block: when
//! the queue is full the oldest event is dropped, preserving the order of
//! what remains. After a terminal event the stream closes and later
//! publishes are discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

/// Compact question info carried by `questions_generated`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionBrief {
    pub id: String,
    pub text: String,
    pub difficulty_level: String,
    pub difficulty_rank: u32,
}

/// Compact run totals carried by `run_complete`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryBrief {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub pass_rate: f64,
}

/// The closed set of lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        run_id: String,
        num_questions: usize,
        difficulty: String,
        /// Non-fatal ingest findings (e.g. missing metadata)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    QuestionsGenerated {
        count: usize,
        questions: Vec<QuestionBrief>,
    },
    DagBuilt {
        question_id: String,
        iteration: u32,
        node_count: usize,
        edge_count: usize,
    },
    CriticResult {
        question_id: String,
        iteration: u32,
        is_approved: bool,
        issues_count: usize,
        overall_reasoning: String,
    },
    ExecutionDone {
        question_id: String,
        success: bool,
        final_answer: Option<Value>,
        execution_time_ms: f64,
        error: Option<String>,
    },
    QuestionComplete {
        question_id: String,
        success: bool,
        iterations: u32,
    },
    RunComplete {
        output_file: String,
        summary: SummaryBrief,
    },
    Error {
        message: String,
    },
}

impl EventKind {
    /// Terminal events close the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunComplete { .. } | Self::Error { .. })
    }

    /// Extract question_id if the event is question-scoped
    pub fn question_id(&self) -> Option<&str> {
        match self {
            Self::DagBuilt { question_id, .. }
            | Self::CriticResult { question_id, .. }
            | Self::ExecutionDone { question_id, .. }
            | Self::QuestionComplete { question_id, .. } => Some(question_id),
            _ => None,
        }
    }
}

/// One delivered frame: `{type, ts, payload}` on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    /// Monotonic per-run sequence (internal ordering witness, not serialized)
    #[serde(skip)]
    pub seq: u64,
    /// RFC 3339 UTC timestamp
    pub ts: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

struct Inner {
    buf: VecDeque<RunEvent>,
    closed: bool,
    dropped: u64,
}

/// Ordered, bounded, single-consumer event queue for one run.
///
/// Clones share the same queue; the registry enforces that only one
/// subscriber drains it.
#[derive(Clone)]
pub struct RunStream {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    capacity: usize,
    next_seq: Arc<AtomicU64>,
}

impl RunStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buf: VecDeque::new(),
                closed: false,
                dropped: 0,
            })),
            notify: Arc::new(Notify::new()),
            capacity: capacity.max(1),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event; returns false if the stream is already closed.
    ///
    /// Never blocks: a full queue drops its oldest event instead.
    pub fn publish(&self, kind: EventKind) -> bool {
        let terminal = kind.is_terminal();
        let event = RunEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            ts: Utc::now().to_rfc3339(),
            kind,
        };

        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        if inner.buf.len() >= self.capacity {
            inner.buf.pop_front();
            inner.dropped += 1;
        }
        inner.buf.push_back(event);
        if terminal {
            inner.closed = true;
        }
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Await the next event; `None` once the stream is closed and drained.
    pub async fn next(&self) -> Option<RunEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(event) = inner.buf.pop_front() {
                    // Wake any publisher-side race loser waiting behind us
                    self.notify.notify_one();
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Events dropped to keep the queue bounded
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Snapshot of pending (undelivered) events, for tests
    pub fn pending(&self) -> usize {
        self.inner.lock().buf.len()
    }
}
