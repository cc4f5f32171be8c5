//! jailbox: interactive line-oriented sandbox for shell commands
//! Runs commands directly or inside one of a fixed pool of pre-provisioned chroot jails

pub mod cli;
pub mod config;
pub mod executor;
pub mod filesystem;
pub mod io_handler;
pub mod isolate;
pub mod lock_manager;
pub mod sandbox;
pub mod types;
