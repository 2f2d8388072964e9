pub mod bridge;
pub mod handlers;
pub mod hub;
pub mod server;
pub mod wire;

pub use server::{start, ServerConfig, ServerDeps, ServerHandle};
