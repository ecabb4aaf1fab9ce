//! Networking: framing, clients, the client registry and the server.

pub mod client;
pub mod client_manager;
pub mod codec;
pub mod config;
pub mod registry;
pub mod server;

pub use client::{Client, ClientId};
pub use client_manager::ClientManager;
pub use codec::{Frame, MessageCodec, DEFAULT_MAX_FRAME_LENGTH};
pub use config::{ClientConfig, ServerConfig, DEFAULT_POOL_SIZE};
pub use registry::ClientRegistry;
pub use server::{Server, ServerBuilder};
