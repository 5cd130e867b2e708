//! # RAT Tunnel
//!
//! 连接级异步请求隧道。客户端 `POST <base>/<handler>` 一个 JSON 请求，服务端立即
//! 返回 200 分块响应头，随后在处理器工作期间每隔一个心跳间隔写出一个空格，最后
//! 写出处理器产生的 JSON 并结束响应。
//!
//! - 响应头在任何处理器工作开始前发出；
//! - 心跳写入失败即视为连接已死，立即结束会话；
//! - 对端断开、心跳失败、处理器完成三条路径都汇聚到同一个一次性释放的
//!   [`Lifetime`]，所有资源恰好清理一次。
//!
//! ```no_run
//! use rat_tunnel::{HandlerRegistry, TunnelConfig, TunnelServer, TunnelResult};
//! use rat_tunnel::{Lifetime, ResultCallback, Value};
//! use std::sync::Arc;
//!
//! # async fn run() -> TunnelResult<()> {
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn(
//!     "echo",
//!     |req: &Value| -> TunnelResult<Value> { Ok(req.clone()) },
//!     |_: Arc<Lifetime>, req: Value, done: ResultCallback| {
//!         done.complete(req);
//!     },
//! )?;
//!
//! let config = TunnelConfig::from_env()?;
//! TunnelServer::bind(config, registry).await?.serve().await
//! # }
//! ```

pub mod error;
pub mod server;
pub mod tunnel;
pub mod utils;

pub use error::{TunnelError, TunnelResult};
pub use server::{TunnelConfig, TunnelServer};
pub use tunnel::{
    Dispatcher, FnHandler, HandlerRegistry, Heartbeat, Lifetime, ResultCallback, SessionEnd,
    ToolboxHandler, TunnelConnection,
};

// 常用依赖的重新导出
pub use bytes::Bytes;
pub use hyper::{Method, StatusCode};
pub use serde_json::{Value, json};
