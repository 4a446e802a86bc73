pub mod agent;
pub mod config;
pub mod llm_client;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod workflow;
