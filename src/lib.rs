pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod store;
pub mod token;

pub use config::Config;
pub use server::{Server, ServerError, Shutdown, State};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
