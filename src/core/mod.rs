pub mod config;
pub mod error;
pub mod idgen;
pub mod types;
