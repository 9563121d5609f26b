pub mod client;
pub mod config;

pub use client::NetworkClient;
pub use config::ClientConfig;
