pub mod cancel;
pub mod graph;
pub mod health;
pub mod lifecycle;

pub use crate::domain::model::{ExecutionPlan, RunReport, RunState, ServiceDescriptor};
pub use crate::domain::ports::{ReadyProbe, ServiceHandle, ServiceRuntime};
pub use crate::utils::error::Result;
pub use cancel::{CancelSignal, CancelToken};
pub use graph::build_plan;
pub use health::{GateOutcome, HealthGate};
pub use lifecycle::Orchestrator;
