//! Run lifecycle events
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`stream`] | Ordered, bounded, single-consumer per-run event queue |
//! | [`registry`] | run_id → handle map with cancellation and cleanup |

pub mod registry;
pub mod stream;

pub use registry::{EventSubscriber, RunHandle, RunRegistry, RunStatus};
pub use stream::{EventKind, QuestionBrief, RunEvent, RunStream, SummaryBrief};
