pub mod adapters;
pub mod cache;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod http;
pub mod model;
pub mod north;
pub mod scan_mode;
pub mod scheduler;
pub mod south;
pub mod transformer;
