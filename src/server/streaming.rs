//! 分块流式响应体
//!
//! 隧道响应体由一个有界 mpsc 通道驱动：写端是 [`ChannelConnection`]，读端包装成
//! hyper 的响应体。hyper 在对端断开后丢弃响应体，读端的 [`DropSignal`] 随之把
//! 连接标记为已关闭，这就是对端断开的触发信号。
//!
//! hyper 先把响应头编码进连接的写缓冲，再第一次轮询响应体。读端记录这次轮询，
//! [`ChannelConnection::opened`] 据此等到响应头已经排在所有数据块之前。

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http_body_util::{BodyExt, Empty, StreamBody, combinators::BoxBody};
use hyper::body::Frame;
use hyper::{Response, StatusCode};
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::connection::TunnelConnection;
use crate::utils::logger::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type TunnelBody = BoxBody<Bytes, BoxError>;
type FrameResult = Result<Frame<Bytes>, BoxError>;

/// 通道中最多缓存的数据块数量
const CHANNEL_CAPACITY: usize = 16;

/// 空响应体
pub fn empty_body() -> TunnelBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// 只有状态码、没有响应体的响应（预分发阶段的拒绝）
pub fn status_response(status: StatusCode) -> Response<TunnelBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// 一次性标志，置位时唤醒所有等待者
#[derive(Default)]
struct Latch {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    fn set(&self) {
        if !self.set.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// 响应体状态，写端与读端共享
#[derive(Default)]
struct BodyState {
    /// 响应体已被轮询过
    opened: Latch,
    closed: Latch,
}

impl BodyState {
    fn mark_closed(&self) {
        self.closed.set();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_set()
    }
}

/// 响应体被 hyper 丢弃时标记连接关闭
struct DropSignal(Arc<BodyState>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

/// 带关闭信号的读端
struct SignalledStream {
    inner: ReceiverStream<FrameResult>,
    signal: DropSignal,
}

impl Stream for SignalledStream {
    type Item = FrameResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.signal.0.opened.set();
        self.inner.poll_next_unpin(cx)
    }
}

/// 基于通道的隧道连接
pub struct ChannelConnection {
    sender: Mutex<Option<mpsc::Sender<FrameResult>>>,
    state: Arc<BodyState>,
    write_timeout: Duration,
}

impl ChannelConnection {
    /// 创建连接与对应的响应体
    ///
    /// `write_timeout` 限定单次写入等待通道空位的时间。
    pub fn new(write_timeout: Duration) -> (Arc<Self>, TunnelBody) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let state = Arc::new(BodyState::default());

        let stream = SignalledStream {
            inner: ReceiverStream::new(receiver),
            signal: DropSignal(state.clone()),
        };
        let body = BodyExt::boxed(StreamBody::new(stream));

        let connection = Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            state,
            write_timeout,
        });
        (connection, body)
    }

    /// 响应体是否已被 hyper 轮询过
    pub fn is_opened(&self) -> bool {
        self.state.opened.is_set()
    }

    /// 等待 hyper 第一次轮询响应体，此时响应头已经写入连接
    pub async fn opened(&self) {
        self.state.opened.wait().await
    }

    fn current_sender(&self) -> Option<mpsc::Sender<FrameResult>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_sender(&self) -> Option<mpsc::Sender<FrameResult>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl TunnelConnection for ChannelConnection {
    async fn write(&self, chunk: Bytes) -> TunnelResult<()> {
        let sender = self
            .current_sender()
            .ok_or_else(|| TunnelError::Transport("连接已关闭".to_string()))?;

        match tokio::time::timeout(self.write_timeout, sender.send(Ok(Frame::data(chunk)))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.state.mark_closed();
                Err(TunnelError::Transport("对端已断开".to_string()))
            }
            Err(_) => Err(TunnelError::Transport(format!(
                "写入超时 ({:?})",
                self.write_timeout
            ))),
        }
    }

    async fn finish(&self) -> TunnelResult<()> {
        // 丢弃最后一个发送端，读端结束后 hyper 写出终止块
        match self.take_sender() {
            Some(sender) if !sender.is_closed() => Ok(()),
            _ => Err(TunnelError::Transport("连接已关闭，无法结束响应".to_string())),
        }
    }

    fn close(&self) {
        if let Some(sender) = self.take_sender() {
            // 以错误帧结束响应体，hyper 会直接中止连接而不写终止块
            let aborted: BoxError = Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "tunnel session closed",
            ));
            if sender.try_send(Err(aborted)).is_err() {
                debug!("🔌 [流式响应] 中止帧未能入队，连接已不可用");
            }
        }
        self.state.mark_closed();
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed() || self.current_sender().is_none_or(|s| s.is_closed())
    }

    async fn closed(&self) {
        self.state.closed.wait().await
    }
}
