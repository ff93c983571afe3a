pub(crate) mod common;

pub(crate) mod filetransfer;
pub(crate) mod messages;
pub(crate) mod session;
