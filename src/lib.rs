pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::ProcessRuntime;
pub use config::{ResolvedConfig, StackConfig};
pub use crate::core::{build_plan, CancelToken, HealthGate, Orchestrator};
pub use domain::model::{ExecutionPlan, RunOutcome, RunReport, ServiceDescriptor};
pub use utils::error::{OrchError, Result};
