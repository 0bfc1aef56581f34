//! notifyd library crate.
//!
//! Multi-tenant notification dispatch: receivers, subscribers and robots,
//! topic matching, per-channel vendor drivers, verification codes and a
//! durable delivery log with retries.

pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
pub mod identity;
pub mod logging;
pub mod notification;
pub mod receiver;
pub mod services;
pub mod subscriber;
pub mod template;
pub mod topic;
pub mod utils;
pub mod verification;

pub use error::{Error, ErrorKind, Result};
