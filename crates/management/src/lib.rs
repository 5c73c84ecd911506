//! Campaign execution controller — lifecycle, execution ledger, scheduler
//! and the REST API the campaign dashboard talks to.
//!
//! Data stored in DashMap (development); swap to PostgreSQL for production.

pub mod handlers;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod router;
pub mod scheduler;
pub mod store;

pub use handlers::{ApiError, ManagementState};
pub use ledger::{ExecutionLedger, LedgerCounts, StagedRun};
pub use lifecycle::{CampaignController, RunOutcome};
pub use router::campaign_router;
pub use scheduler::{ExecutionScheduler, TickReport};
pub use store::CampaignStore;
