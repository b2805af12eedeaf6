//! Per-user GPU quota enforcement for shared hosts.
//!
//! Each pass inventories GPU compute processes, attributes them to tenants,
//! and terminates processes of tenants that occupy more devices than allowed.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod logging;
pub mod policy;
pub mod process_meta;
pub mod regulator;
pub mod terminator;

pub use error::RegulatorError;
pub use policy::EvictionDecision;
pub use policy::Quota;
pub use regulator::PassReport;
pub use regulator::Regulator;
