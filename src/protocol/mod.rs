//! L5 wire protocol: frame format, request/response
//! payloads, connection state machine, request dispatch/authorization,
//! and the TCP server tying them together.

pub mod codec;
pub mod dispatch;
pub mod frame;
pub mod message;
pub mod response;
pub mod server;
pub mod session;

pub use dispatch::Dispatcher;
pub use frame::{FrameHeader, MessageType};
pub use server::Server;
pub use session::Session;
