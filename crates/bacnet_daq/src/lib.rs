//! bacnet-daq - multi-device BACnet/IP polling and discovery engine
//!
//! This crate provides:
//! - Layered fleet configuration (gateways, remote devices, variables)
//! - Partitioning of the fleet into one device group per local gateway
//! - Discovery of configured remote devices and their object inventories
//! - Per-group poll scheduling with batched reads and failure isolation
//! - Writes with read-back verification
//! - Supervision of group processes with a respawn ceiling

// Re-export the building blocks
pub use bacnet_stack;
pub use daq_runtime;

pub mod client;
pub mod config;
pub mod convert;
pub mod discovery;
pub mod error;
pub mod inventory;
pub mod model;
pub mod process;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod topology;
pub mod write;

#[cfg(test)]
mod testing;

pub use config::DaqConfig;
pub use error::{DaqError, DaqResult, ErrorKind};
pub use model::{DeviceId, LocalGateway, MonitoredObject, PollResult, RemoteDevice, VariableId};
pub use scheduler::{GroupState, PollScheduler};
pub use topology::{DeviceGroupSpec, build_groups};
