//! Toolbox 隧道
//!
//! 一个被接受的请求就是一个会话：响应头立即返回，处理器在工作线程上运行，
//! 期间以空格心跳保持连接，最终写出一个 JSON 数据块。会话的所有资源都挂在
//! [`lifetime::Lifetime`] 上，由对端断开、心跳失败、处理器完成中最先发生的一个释放。

pub mod completion;
pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod heartbeat;
pub mod lifetime;
pub mod registry;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use completion::{CompletionSignal, ResultCallback, SessionEnd, completion_signal};
pub use connection::TunnelConnection;
pub use dispatcher::{Dispatcher, SessionHandle};
pub use handler::{FnHandler, ParsedRequest, RegisteredHandler, ToolboxHandler};
pub use heartbeat::Heartbeat;
pub use lifetime::Lifetime;
pub use registry::HandlerRegistry;
pub use validator::{RequestValidator, Verdict};
