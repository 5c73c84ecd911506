//! Workflow deployment adapter — bridges campaign flows to the external
//! automation engine (n8n).
//!
//! The engine sits behind the [`AutomationEngine`] trait. [`N8nRestEngine`]
//! talks to a live n8n instance; [`InMemoryEngine`] serves development and
//! tests.

pub mod adapter;
pub mod engine;
pub mod memory;
pub mod n8n;
pub mod rest;

pub use adapter::{Deployment, DeploymentAdapter, WorkflowStatus};
pub use engine::{AutomationEngine, EngineError, ExecutionMode, WorkflowExecution};
pub use memory::InMemoryEngine;
pub use n8n::N8nWorkflow;
pub use rest::{HttpPoolConfig, N8nRestEngine};
