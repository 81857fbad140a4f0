//! CLI command implementations.

pub mod config;
pub mod init;
pub mod simulate;
pub mod version;
