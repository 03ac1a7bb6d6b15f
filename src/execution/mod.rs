//! Pipeline execution engine

pub mod engine;
pub mod events;
pub mod executor;
pub mod scheduler;

pub use engine::{ControlHandle, ExecutionEngine};
pub use events::{EventBus, EventHandler, ExecutionEvent};
pub use executor::{ExecutionOutcome, JobExecutor};
pub use scheduler::{
    Disposition, ExecutionPlan, ManualGatePolicy, Readiness, SchedulingStrategy, StageScheduler,
};
