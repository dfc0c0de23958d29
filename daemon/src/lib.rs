// Costwise Daemon Library
// Exposes internal modules for the costwised binary and for testing

#[macro_use]
extern crate log;

pub mod config;
pub mod core;
pub mod rpc;
