//! Built-in step executors
//!
//! One executor per step type, plus the manual-operator fallback strategy.

mod conditional;
mod http;
mod human_input;
mod operator;
mod parallel;
mod subflow;
mod system;

pub use conditional::ConditionalExecutor;
pub use http::HttpExecutor;
pub use human_input::HumanInputExecutor;
pub use operator::ManualOperatorFallback;
pub use parallel::ParallelGroupExecutor;
pub use subflow::{SubWorkflowExecutor, WorkflowLibrary};
pub use system::SystemExecutor;

use std::sync::Arc;
use weftcore::StepType;
use weftruntime::{SelfHealingPolicy, StepDispatcher};

/// Register every built-in executor with a dispatcher.
///
/// Integration calls without a service-specific executor go to
/// [`HttpExecutor`], which is also registered under the `http` service.
/// Returns the library that `sub-agent-spawn` steps draw from.
pub fn register_all(dispatcher: &mut StepDispatcher) -> Arc<WorkflowLibrary> {
    let library = Arc::new(WorkflowLibrary::new());
    let http = Arc::new(HttpExecutor::new());

    dispatcher.register(StepType::SystemReasoning, Arc::new(SystemExecutor));
    dispatcher.register(StepType::ConditionalLogic, Arc::new(ConditionalExecutor));
    dispatcher.register(StepType::IntegrationCall, http.clone());
    dispatcher.register_integration("http", http);
    dispatcher.register(StepType::ParallelGroup, Arc::new(ParallelGroupExecutor));
    dispatcher.register(StepType::SubAgentSpawn, Arc::new(SubWorkflowExecutor::new(library.clone())));
    dispatcher.register(StepType::HumanInput, Arc::new(HumanInputExecutor));

    library
}

/// Self-healing policy that queues failed integration calls for a manual
/// operator.
pub fn operator_fallback() -> SelfHealingPolicy {
    SelfHealingPolicy::new().with_type_strategy(StepType::IntegrationCall, Arc::new(ManualOperatorFallback))
}
