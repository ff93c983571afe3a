pub mod commit;
pub mod config;
pub mod engine;
mod goahead;
pub mod info;
pub mod items;
pub mod paths;
pub mod plugin;
pub mod queue;
pub mod registry;
mod receive;
mod send;
pub mod server;

#[cfg(test)]
mod tests;
