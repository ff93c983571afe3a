#![deny(clippy::await_holding_refcell_ref)]

pub mod common;
pub mod gahp;
pub mod job;
pub mod manager;
pub mod proxy;
pub mod queue;
pub mod resource;
pub mod staging;
pub mod transferd;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::GmError;
pub type Result<T> = std::result::Result<T, Error>;

// Reexports
pub use sandbox;
pub use sandbox::{Map, Set, WrappedRcRefCell};

pub use crate::job::JobId;

pub const GM_VERSION: &str = {
    match option_env!("GM_BUILD_VERSION") {
        Some(version) => version,
        None => const_format::concatcp!(env!("CARGO_PKG_VERSION"), "-dev"),
    }
};
