pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod rpc;
pub mod setup;
pub mod utils;
