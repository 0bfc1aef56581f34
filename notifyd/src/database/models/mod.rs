//! Database models.
//!
//! Rows map one-to-one onto the tables in `migrations/`; enum-valued
//! columns are stored as their snake_case names.

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
