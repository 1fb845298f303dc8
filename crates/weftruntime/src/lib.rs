//! Workflow execution runtime
//!
//! Variable resolution, dependency analysis, the wavefront scheduler, step
//! dispatch with retry and fallback, execution state persistence and the
//! [`Engine`] facade that ties them together.

mod config;
mod dispatcher;
mod engine;
mod fallback;
mod graph;
mod middleware;
mod notifier;
mod resolver;
mod retry;
mod scheduler;
mod state;
pub mod store;
pub mod template;

pub use config::{ConfigError, EngineConfig};
pub use dispatcher::{StepDispatcher, StepOutcome};
pub use engine::{Engine, EngineBuilder, ExecutionSnapshot};
pub use fallback::{FallbackPolicy, NoFallback, SelfHealingPolicy};
pub use graph::{DanglingReference, DependencyGraph};
pub use middleware::{MetricsSnapshot, StepMetrics, StepMiddleware, TracingMiddleware};
pub use notifier::Notifier;
pub use resolver::{unresolved_references, VariableResolver};
pub use retry::{StepReport, StepRunner};
pub use scheduler::{RunOptions, Scheduler, MAX_NESTING};
pub use state::ExecutionStateStore;
pub use store::{FileStateStore, MemoryStateStore, StateStore};
