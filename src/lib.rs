pub mod cli;
pub mod config;
pub mod error;
pub mod isolation;
pub mod orchestration;
pub mod plan;
pub mod provider;
