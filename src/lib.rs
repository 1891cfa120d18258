pub mod agent;
pub mod config;
pub mod export;
pub mod host;
pub mod power;
pub mod sink;
