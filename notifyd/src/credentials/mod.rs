//! Per-(channel, domain) credentials and vendor access tokens.
//!
//! - [`TokenCache`]: config lookup plus in-memory access tokens with
//!   single-flight refresh
//! - [`TokenSource`]: implemented by drivers that exchange credentials for
//!   a bearer token
//! - [`FileTokenStore`]: on-disk token cache shared across restarts
//! - [`ConfigService`]: create, update and validate channel configs

mod cache;
mod file_store;
mod service;

pub use cache::{AccessToken, TokenCache, TokenSource};
pub use file_store::{FileToken, FileTokenStore};
pub use service::{ConfigService, ConfigValidation};
