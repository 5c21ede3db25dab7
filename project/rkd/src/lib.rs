//! rkd: the rk cluster as a single binary.
//!
//! The binary carries a bundle of executables. On each run it stages that
//! bundle into a versioned data directory, then either replaces itself with
//! one of the bundled tools or runs a server or agent role in-process.

pub mod agent;
pub mod assets;
pub mod cli;
pub mod components;
pub mod config;
pub mod datadir;
pub mod host;
pub mod error;
pub mod launch;
pub mod server;
pub mod staging;
pub mod token;

pub const PROGRAM: &str = "rkd";

/// Points launched processes at the active version directory.
pub const DATA_DIR_ENV: &str = "RKD_DATA_DIR";
