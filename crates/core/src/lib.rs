//! Shared foundation for the campaign execution controller: configuration,
//! the error taxonomy, campaign/ledger domain types and the flow graph model.

pub mod config;
pub mod error;
pub mod flow;
pub mod types;

pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
pub use flow::{FlowData, FlowEdge, FlowNode, NodeType};
pub use types::{Campaign, CampaignStatus, ExecutionRecord, ExecutionStatus, ProgressSnapshot};
