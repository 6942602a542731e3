pub mod aggregate;
pub mod coordinator;
pub mod types;
