//! # Configuration
//!
//! Layered configuration shared by the server binary and the CLI.

pub mod server;
