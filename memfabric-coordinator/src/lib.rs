//! Multi-principal coordination for the memory fabric.
//!
//! A [`Coordinator`] owns one event bus and broadcaster and any number of
//! registered principals, each with its own bounded store. It routes reads
//! and writes, publishes changes between sharing principals, reconciles
//! shared keys ([`Coordinator::synchronize_all`]), moves entries between
//! principals and reports health.
//!
//! ```no_run
//! # async fn demo() -> memfabric_coordinator::CoordinatorResult<()> {
//! use memfabric_coordinator::{Coordinator, CoordinatorConfig, PrincipalConfig, SyncMode};
//! use memfabric_types::{PrincipalId, Value};
//!
//! let coordinator = Coordinator::new(CoordinatorConfig::default());
//! let planner = PrincipalId::new("planner").expect("valid id");
//! coordinator
//!     .register_principal(PrincipalConfig::new(planner.clone(), 1 << 20).sharing(true))
//!     .await?;
//! coordinator.store(&planner, "goal", Value::from("ship it"), None).await?;
//! coordinator.synchronize_all(SyncMode::Incremental).await?;
//! coordinator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod error;
mod metrics;
mod principal;
mod sync;

pub use config::{CoordinatorConfig, PrincipalConfig};
pub use coordinator::{Coordinator, CoordinatorSignal, MaintenanceReport};
pub use error::{CoordinatorError, CoordinatorResult};
pub use metrics::{CoordinatorMetrics, system_health};
pub use principal::{PrincipalHealth, PrincipalStatus};
pub use sync::{
    BalanceMove, LoadBalanceReport, SyncMode, SyncReport, TransferReport, TransferRequest,
};
