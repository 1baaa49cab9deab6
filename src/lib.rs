pub mod component;
pub mod config;
pub mod error;
pub mod flow;
pub mod logger;
pub mod orchestrator;
pub mod process;
