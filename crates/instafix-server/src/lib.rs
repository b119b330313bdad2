//! InstaFix daemon: configuration, service wiring and background maintenance.

pub mod config;
pub mod maintenance;
pub mod services;

pub use config::{parse_byte_size, resolve_data_dir, Settings};
pub use services::Services;
