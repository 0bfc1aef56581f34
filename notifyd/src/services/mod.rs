//! Service layer module.
//!
//! This module provides the service container that wires the
//! repositories, drivers and background loops together.

pub mod container;

pub use container::{DriverContext, ServiceContainer, default_drivers};
