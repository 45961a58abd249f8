//! 请求层
//! 缓存和排队需要延迟处理的报文，并把异步到达的回复转换成阻塞等待

pub use cache::{Request, RequestCache};
pub use handler::RequestHandler;
pub use queue::{RequestPusher, RequestQueue};

pub mod cache;
pub mod handler;
pub mod queue;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Request queue closed")]
    Closed,
    #[error("Request timeout")]
    Timeout,
    #[error("Unknown request id: {0}")]
    UnknownRequest(u32),
    #[error("Request {0} already has a waiter")]
    AlreadyWaiting(u32),
    #[error("Request {0} was cancelled")]
    Cancelled(u32),
}
