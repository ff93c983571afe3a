//! Client side of the remote-operation helper ("GAHP").
//!
//! Every remote operation of a job goes through its own [`GahpClient`]. The client
//! keeps at most one call outstanding, reports an identical retried call as pending
//! and hands the final reply out exactly once. The helper itself is represented by
//! a [`GahpServer`] shared by all jobs using the same helper configuration.

mod client;
pub mod process;
mod request;
mod server;

pub use client::{CallResult, GahpClient, GahpMode};
pub use process::{GahpProcessConfig, ProcessTransport};
pub use request::{
    AUTH_FAILED_ERROR_CODE, GAHP_ERROR_CODE, GahpReply, GahpRequest, TIMEOUT_ERROR_CODE,
};
pub use server::{GahpFuture, GahpResult, GahpServer, GahpServerRef, GahpServers, GahpTransport};
