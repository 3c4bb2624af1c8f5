//! Domain documents -- environments, interfaces, tasks, and results.
//!
//! The surrounding system owns CRUD for these documents; the engine
//! consumes them read-only and produces `RunResult` documents.

pub mod environment;
pub mod interface;
pub mod result;
pub mod task;

pub use environment::Environment;
pub use interface::Interface;
pub use result::{
    AssertionOutcome, CaseError, CaseResult, CaseStatus, RequestRecord, ResponseRecord, RunResult,
    RunStatus, Summary, Trigger,
};
pub use task::{Case, NotificationPolicy, Schedule, Task};
