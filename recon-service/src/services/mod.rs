pub mod database;
pub mod engine;
pub mod gateway;
pub mod matching;
pub mod metrics;
pub mod orders;

pub use database::{Database, OrderStore, RunStore};
pub use engine::{RunOrchestrator, RunOutcome, ToleranceOverrides};
pub use gateway::{GatewayClient, GatewayStatus, HttpGatewayClient};
pub use matching::{MatchStrategy, MissingDatePolicy, TolerancePolicy};
pub use orders::OrderReconciler;
