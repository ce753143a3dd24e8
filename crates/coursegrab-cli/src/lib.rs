//! coursegrab command-line driver: configuration, CAS login, catalog search
//! and the `grab` loop with live progress.

pub mod auth;
pub mod commands;
pub mod config;
pub mod output;
pub mod secrets;

pub use auth::{AuthError, CasAuthenticator};
pub use config::{resolve_config_path, AppConfig, Overrides};
