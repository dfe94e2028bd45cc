//! Processor identification, cache and core topology discovery.
//!
//! [`get_machine_information`] runs every applicable probe driver once per
//! measurement mode and memoizes the resulting [`MachineProfile`]. Embedders
//! that need their own drivers, a recorded identification table or an
//! isolated memo build a [`Gatherer`] instead.

pub mod affinity;
pub mod config;
pub mod decode;
pub mod error;
pub mod gatherer;
pub mod log_manager;
pub mod logging;
pub mod merge;
pub mod models;
pub mod opcode;
pub mod providers;

pub use config::DiscoveryOptions;
pub use error::{ConfigError, Error, ProbeError, RegisterError, Result};
pub use gatherer::{Gatherer, GathererBuilder, ProfileCache, get_machine_information};
pub use models::MachineProfile;
pub use providers::{CoreContext, InformationProvider, PerCoreMode, ProbeContext};
