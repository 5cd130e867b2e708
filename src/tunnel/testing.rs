//! 测试用连接：记录所有写入事件

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::connection::{HEARTBEAT_FRAME, TunnelConnection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    Write(Bytes),
    Finish,
    Close,
}

#[derive(Default)]
pub struct RecordingConnection {
    events: Mutex<Vec<ConnEvent>>,
    closed: AtomicBool,
    notify: Notify,
    /// 第几次写入开始失败（从 1 开始计数，0 表示从不失败）
    fail_from: AtomicUsize,
    attempts: AtomicUsize,
    write_delay: Mutex<Option<Duration>>,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 从第 `n` 次写入开始返回失败
    pub fn failing_from(n: usize) -> Arc<Self> {
        let conn = Self::default();
        conn.fail_from.store(n, Ordering::SeqCst);
        Arc::new(conn)
    }

    /// 每次写入耗时 `delay`
    pub fn slow(delay: Duration) -> Arc<Self> {
        let conn = Self::default();
        *conn.write_delay.lock().unwrap() = Some(delay);
        Arc::new(conn)
    }

    pub fn events(&self) -> Vec<ConnEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ConnEvent::Write(b) if &b[..] == HEARTBEAT_FRAME))
            .count()
    }

    /// 除心跳外的写入
    pub fn payload_writes(&self) -> Vec<Bytes> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ConnEvent::Write(b) if &b[..] != HEARTBEAT_FRAME => Some(b),
                _ => None,
            })
            .collect()
    }

    /// 模拟对端断开
    pub fn disconnect(&self) {
        self.mark_closed();
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl TunnelConnection for RecordingConnection {
    async fn write(&self, chunk: Bytes) -> TunnelResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail_from = self.fail_from.load(Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) || (fail_from != 0 && attempt >= fail_from) {
            return Err(TunnelError::Transport("recording connection closed".to_string()));
        }
        self.events.lock().unwrap().push(ConnEvent::Write(chunk));
        Ok(())
    }

    async fn finish(&self) -> TunnelResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Transport("recording connection closed".to_string()));
        }
        self.events.lock().unwrap().push(ConnEvent::Finish);
        self.mark_closed();
        Ok(())
    }

    fn close(&self) {
        self.events.lock().unwrap().push(ConnEvent::Close);
        self.mark_closed();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}
