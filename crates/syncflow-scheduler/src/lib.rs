//! # Syncflow Scheduler
//!
//! Task orchestrator: turns recurring schedules into leased,
//! heartbeat-monitored units of work and collects their outcome.
//!
//! ## Guarantees
//! - At most one STARTED task per group key, enforced by the store
//! - Terminal transitions happen exactly once; identical repeats are no-ops
//! - A dead worker's task is reclaimed by the sweep and retried up to `retryMax`
//! - A schedule never has more than one outstanding task
//!
//! ## Architecture
//! ```text
//! Orchestrator (engine)
//!   ├── SchedulerDb (SQLite, IMMEDIATE transactions)
//!   │     ├── task store:     create / dequeue / heartbeat / terminal / sweep
//!   │     └── schedule store: create / update / due / materialize / run now
//!   ├── EventBus (tokio broadcast) → output waiters, long-poll dequeue
//!   └── Scheduler loop (tokio interval)
//!         ├── materialization pass
//!         └── sweep pass
//! ```

pub mod clock;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod schedule_store;
pub mod schedules;
pub mod task_store;
pub mod tasks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Orchestrator, ScheduleRequest, TaskRequest, TickReport, spawn_scheduler};
pub use notify::{EventBus, TaskEvent};
pub use persistence::SchedulerDb;
pub use schedules::{Schedule, ScheduleFilter, SchedulePatch, ScheduleState};
pub use tasks::{GroupKeyPattern, PolicyOverrides, Task, TaskFilter, TaskPolicy, TaskState, Transition};
