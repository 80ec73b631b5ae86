pub mod client;
pub mod config;
pub mod manager;
pub mod pool;
pub mod process;
