//! The task store façade and the pieces that only make sense with all components
//! assembled: transactions, maintenance, health and verification.

mod health;
mod maintenance;
mod metrics;
mod store;
mod transaction;
mod verify;


pub use health::{Check, HealthCheck, HealthStatus};
pub use maintenance::MaintenanceReport;
pub use metrics::StoreMetrics;
pub use store::{CommitResult, OpResult, TaskStore, VacuumOutcome};
pub use transaction::{TransactionInfo, TxState};
pub use verify::VerifyReport;
