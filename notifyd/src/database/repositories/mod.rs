//! Repository layer for database access.
//!
//! Every table group gets an `async_trait` repository trait and a
//! `Sqlx*Repository` implementation over the shared pool.

pub mod config;
pub mod notification;
pub mod receiver;
pub mod robot;
pub mod subscriber;
pub mod template;
pub mod topic;
pub mod verification;

pub use config::*;
pub use notification::*;
pub use receiver::*;
pub use robot::*;
pub use subscriber::*;
pub use template::*;
pub use topic::*;
pub use verification::*;
