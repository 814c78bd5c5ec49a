//! TCP streaming layer: acceptor, per-client receivers, the broadcast
//! sender, and the command processor bridge.

pub mod client;
pub mod commands;
mod receiver;
mod sender;
mod server;

pub use commands::{
    CommandHandler, CommandProcessor, CommandResponse, PendingCommand, TrackerCommandHandler,
};
pub use server::{IgtlServer, ServerSettings, CLIENT_SOCKET_TIMEOUT_SEC};
