pub mod auth;
pub mod config;
pub mod protocol;
pub mod report;
pub mod scanner;
pub mod tracing;
