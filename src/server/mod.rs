//! RAT Tunnel 服务器模块
//!
//! 接受 TCP 连接并以 HTTP/1.1 提供 Toolbox 隧道服务。每个连接一个 tokio 任务，
//! 请求交给 [`Dispatcher`] 处理。

pub mod config;
pub mod streaming;
pub mod worker_pool;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;

use crate::error::TunnelResult;
use crate::tunnel::dispatcher::Dispatcher;
use crate::tunnel::registry::HandlerRegistry;
use crate::utils::logger::{debug, error, info};

pub use config::TunnelConfig;

/// Toolbox 隧道服务器
pub struct TunnelServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl TunnelServer {
    /// 绑定配置中的监听地址
    pub async fn bind(config: TunnelConfig, registry: HandlerRegistry) -> TunnelResult<Self> {
        let addr = config.bind_addr;
        let dispatcher = Arc::new(Dispatcher::new(config, registry)?);
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, dispatcher })
    }

    /// 实际监听的地址（绑定 0 端口时由系统分配）
    pub fn local_addr(&self) -> TunnelResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// 运行直到收到 Ctrl+C
    pub async fn serve(self) -> TunnelResult<()> {
        self.serve_with_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("❌ [服务端] 无法监听 Ctrl+C 信号: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// 运行直到 `shutdown` 完成
    ///
    /// 停止后不再接受新连接，已建立的连接继续处理完各自的会话。
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> TunnelResult<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.local_addr()?;
        info!(
            "🚀 [服务端] Toolbox 隧道监听于 http://{}{}",
            local_addr,
            self.dispatcher.config().base_path
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 [服务端] 收到停止信号，不再接受新连接");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let dispatcher = self.dispatcher.clone();
                        tokio::spawn(serve_connection(stream, remote_addr, dispatcher));
                    }
                    Err(e) => error!("❌ [服务端] 接受连接失败: {}", e),
                }
            }
        }

        Ok(())
    }
}

/// 设置连接的套接字选项，失败只记录日志
///
/// 读超时由 hyper 的 `header_read_timeout` 承担，写超时由响应体通道承担。
fn configure_stream(stream: &TcpStream, remote_addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("⚠️ [服务端] 设置 TCP_NODELAY 失败: {} ({})", remote_addr, e);
    }
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        debug!("⚠️ [服务端] 设置 SO_KEEPALIVE 失败: {} ({})", remote_addr, e);
    }
}

async fn serve_connection(stream: TcpStream, remote_addr: SocketAddr, dispatcher: Arc<Dispatcher>) {
    configure_stream(&stream, remote_addr);

    let header_timeout = dispatcher.config().io_timeout();
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatcher.handle(req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout)
        .serve_connection(io, service)
        .await
    {
        if is_disconnect(&e) {
            debug!("🔌 [服务端] 客户端断开连接: {} ({})", remote_addr, e);
        } else {
            error!("❌ [服务端] HTTP/1.1 连接处理失败: {} ({})", remote_addr, e);
        }
    }
}

/// 对端断开、超时或会话主动中止都不算服务端错误
fn is_disconnect(e: &hyper::Error) -> bool {
    if e.is_incomplete_message() || e.is_canceled() || e.is_closed() || e.is_timeout() || e.is_user() {
        return true;
    }
    let msg = e.to_string();
    msg.contains("connection closed")
        || msg.contains("broken pipe")
        || msg.contains("connection reset")
        || msg.contains("unexpected end of file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accepted_stream_gets_nodelay_and_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, remote_addr) = listener.accept().await.unwrap();

        configure_stream(&stream, remote_addr);

        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[test]
    fn test_header_read_timeout_is_twice_heartbeat() {
        let config = TunnelConfig::default().with_heartbeat(std::time::Duration::from_millis(100));
        assert_eq!(config.io_timeout(), std::time::Duration::from_millis(200));
    }
}
