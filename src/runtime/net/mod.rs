pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod wire;

pub use error::Error;
pub use sender::{ReceivedMessage, Sender, SenderRef};

pub const DEFAULT_PORT: u16 = 4137;
/// Frames above this size are treated as a broken stream.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
