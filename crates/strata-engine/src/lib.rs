pub mod branch;
pub mod executor;
pub mod gate;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod strategy;
pub mod swarm;

pub use branch::{merge_outputs, BranchCoordinator, BranchResult, BranchSpec};
pub use executor::UnifiedExecutor;
pub use gate::{GateDecision, GateRequest, MoiseGate};
pub use service::{
    RunRequest, RunStatusView, ServiceBuilder, SwarmExecutionService, SwarmRequest, SwarmStatus,
    SystemMetrics,
};
pub use state_machine::{GatedStepExecutor, RunControl, RunStateMachine};
pub use store::SqliteStore;
pub use strategy::{
    ConversationalStrategy, DeterministicStrategy, ReasoningStrategy, StrategyFactory,
};
pub use swarm::SwarmCoordinator;
