//! 心跳调度器
//!
//! 处理器工作期间，以固定延迟向连接写入单空格心跳帧，防止中间设备因空闲而
//! 断开连接。任何一次写入失败都视为连接已死：立即释放会话生命周期，不重试。
//!
//! 取消心跳不会打断正在进行的写入；完成流水线通过 [`Heartbeat::stop`] 等待最后
//! 一次写入结束后才写最终数据块，保证心跳字节不会与真正的响应交错。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::tunnel::connection::{HEARTBEAT_FRAME, TunnelConnection};
use crate::tunnel::lifetime::Lifetime;
use crate::utils::logger::{debug, warn};

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelState {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 一个会话的心跳任务
pub struct Heartbeat {
    interval: Duration,
    cancel: Arc<CancelState>,
    beats: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// 启动心跳
    ///
    /// 第一次心跳在 `interval` 之后发出。返回的句柄已注册到 `lifetime`，会话结束时
    /// 自动取消。需要在 tokio 运行时中调用。
    pub fn start(
        connection: Arc<dyn TunnelConnection>,
        lifetime: Arc<Lifetime>,
        interval: Duration,
    ) -> Arc<Self> {
        let cancel = Arc::new(CancelState::default());
        let beats = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run_heartbeat(
            connection,
            lifetime.clone(),
            interval,
            cancel.clone(),
            beats.clone(),
        ));

        let heartbeat = Arc::new(Self {
            interval,
            cancel,
            beats,
            task: Mutex::new(Some(task)),
        });

        let handle = heartbeat.clone();
        lifetime.register_cleanup(move || handle.cancel());

        debug!("💓 [心跳] {} 启动，间隔 {:?}", lifetime, interval);
        heartbeat
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 已成功写出的心跳数量
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 取消后续心跳，不等待正在进行的写入
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 取消心跳并等待最后一次写入结束
    ///
    /// 最多等待 `max_wait`；超时返回 `false`。重复调用立即返回 `true`。
    pub async fn stop(&self, max_wait: Duration) -> bool {
        self.cancel();

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            return true;
        };

        match tokio::time::timeout(max_wait, task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("⚠️ [心跳] 心跳任务异常结束: {}", e);
                true
            }
            Err(_) => {
                warn!("⏰ [心跳] 等待最后一次心跳写入超时 ({:?})", max_wait);
                false
            }
        }
    }
}

async fn run_heartbeat(
    connection: Arc<dyn TunnelConnection>,
    lifetime: Arc<Lifetime>,
    interval: Duration,
    cancel: Arc<CancelState>,
    beats: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        // 写入不参与 select，取消不会打断进行中的写入
        match connection.write(Bytes::from_static(HEARTBEAT_FRAME)).await {
            Ok(()) => {
                let n = beats.fetch_add(1, Ordering::AcqRel) + 1;
                debug!("💓 [心跳] {} 第 {} 次心跳", lifetime, n);
            }
            Err(e) => {
                debug!("💔 [心跳] {} 心跳写入失败，结束会话: {}", lifetime, e);
                lifetime.dispose();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::{ConnEvent, RecordingConnection};

    #[tokio::test(start_paused = true)]
    async fn test_beats_at_fixed_delay() {
        let conn = RecordingConnection::new();
        let lifetime = Lifetime::new("hb");
        let heartbeat = Heartbeat::start(conn.clone(), lifetime.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(heartbeat.beats(), 3);
        assert_eq!(conn.heartbeat_count(), 3);

        assert!(heartbeat.stop(Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(conn.heartbeat_count(), 3, "停止后不应再有心跳");
        assert!(!lifetime.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_beat_before_first_interval() {
        let conn = RecordingConnection::new();
        let lifetime = Lifetime::new("hb-fast");
        let heartbeat = Heartbeat::start(conn.clone(), lifetime, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(heartbeat.stop(Duration::from_secs(1)).await);
        assert!(conn.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_disposes_lifetime() {
        let conn = RecordingConnection::failing_from(2);
        let lifetime = Lifetime::new("hb-fail");
        let heartbeat = Heartbeat::start(conn.clone(), lifetime.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(lifetime.is_disposed());
        assert!(heartbeat.is_cancelled(), "释放生命周期应取消心跳");
        assert_eq!(heartbeat.beats(), 1);
        assert_eq!(conn.events(), vec![ConnEvent::Write(Bytes::from_static(b" "))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_heartbeat() {
        let conn = RecordingConnection::new();
        let lifetime = Lifetime::new("hb-dispose");
        let heartbeat = Heartbeat::start(conn.clone(), lifetime.clone(), Duration::from_millis(100));

        lifetime.dispose();
        assert!(heartbeat.is_cancelled());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(conn.heartbeat_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_write() {
        let conn = RecordingConnection::slow(Duration::from_millis(80));
        let lifetime = Lifetime::new("hb-slow");
        let heartbeat = Heartbeat::start(conn.clone(), lifetime, Duration::from_millis(100));

        // 第一次心跳在 100ms 开始写，180ms 写完
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(conn.heartbeat_count(), 0);

        assert!(heartbeat.stop(Duration::from_secs(1)).await);
        assert_eq!(conn.heartbeat_count(), 1, "进行中的写入必须完成后 stop 才返回");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded() {
        let conn = RecordingConnection::slow(Duration::from_secs(60));
        let lifetime = Lifetime::new("hb-stuck");
        let heartbeat = Heartbeat::start(conn, lifetime, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!heartbeat.stop(Duration::from_millis(100)).await);
        // 第二次调用不会再等待
        assert!(heartbeat.stop(Duration::from_millis(100)).await);
    }
}
