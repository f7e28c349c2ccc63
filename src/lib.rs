pub mod config;
pub mod context;
pub mod daemon;
pub mod decision;
pub mod errors;
pub mod gatekeeper;
pub mod integrity;
pub mod invoker;
pub mod mailbox;
pub mod store;
pub mod tracker;
pub mod workflow_config;
