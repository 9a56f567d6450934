pub mod handler;
pub(crate) mod inbox;
pub mod logical_thread;
pub mod manager;

pub use handler::{
    LogicalThreadFactory, NoRequests, RequestHandler, SharedHandler,
};
pub use logical_thread::{LogicalThread, LogicalThreadHandle};
pub use manager::LogicalThreadManager;
