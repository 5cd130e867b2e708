//! 完成信号与完成流水线
//!
//! 处理器在工作线程上通过 [`ResultCallback`] 交付结果，完成信号把结果带回
//! 连接所在的异步运行时，由 [`CompletionPipeline`] 收尾：
//!
//! 1. 停止心跳，并等待进行中的心跳写入结束；
//! 2. 生命周期已释放（对端已断开）时只做防御性关闭，不写任何数据；
//! 3. 否则序列化结果（失败时为 `{"status":"error"}`），写出最终数据块并结束分块流；
//! 4. 释放生命周期。与其它终止路径的竞争由生命周期的幂等性吸收。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::connection::TunnelConnection;
use crate::tunnel::heartbeat::Heartbeat;
use crate::tunnel::lifetime::Lifetime;
use crate::utils::logger::{debug, warn};

/// 处理器的产出
pub type HandlerOutcome = TunnelResult<Value>;

/// 创建一对单次写入的结果回调与完成信号
pub fn completion_signal(label: impl Into<String>) -> (ResultCallback, CompletionSignal) {
    let (sender, receiver) = oneshot::channel();
    let callback = ResultCallback {
        inner: Arc::new(CallbackInner {
            label: label.into(),
            sender: Mutex::new(Some(sender)),
        }),
    };
    (callback, CompletionSignal { receiver })
}

struct CallbackInner {
    label: String,
    sender: Mutex<Option<oneshot::Sender<HandlerOutcome>>>,
}

/// 处理器结果回调
///
/// 可以克隆并跨线程传递；只有第一次交付生效，之后的交付记录警告并被忽略。
/// 所有克隆都被丢弃而从未交付时，完成信号得到 `HandlerFailure`。
#[derive(Clone)]
pub struct ResultCallback {
    inner: Arc<CallbackInner>,
}

impl ResultCallback {
    /// 交付成功结果，返回本次交付是否生效
    pub fn complete(&self, result: Value) -> bool {
        self.deliver(Ok(result))
    }

    /// 交付失败，返回本次交付是否生效
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.deliver(Err(TunnelError::HandlerFailure(reason.into())))
    }

    /// 交付任意结果
    pub fn deliver(&self, outcome: HandlerOutcome) -> bool {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    debug!("🔕 [完成信号] {} 的接收端已不存在，结果被丢弃", self.inner.label);
                }
                true
            }
            None => {
                warn!("⚠️ [完成信号] {} 的结果回调被重复调用，已忽略", self.inner.label);
                false
            }
        }
    }

    /// 是否已经交付过结果
    pub fn is_completed(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for ResultCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCallback")
            .field("label", &self.inner.label)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// 单次读取的完成信号
pub struct CompletionSignal {
    receiver: oneshot::Receiver<HandlerOutcome>,
}

impl CompletionSignal {
    /// 等待处理器结果
    pub async fn wait(self) -> HandlerOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TunnelError::HandlerFailure(
                "结果回调在交付前被丢弃".to_string(),
            )),
        }
    }
}

/// 会话结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 最终数据块已写出，分块流正常结束
    Delivered,
    /// 会话已被其它路径结束，结果被丢弃
    Discarded,
    /// 最终数据块写入失败
    WriteFailed,
}

/// 错误时写出的规范 JSON
pub fn error_payload() -> Value {
    json!({ "status": "error" })
}

/// 把处理器结果序列化为最终数据块
pub fn render_payload(outcome: HandlerOutcome) -> Bytes {
    let value = match outcome {
        Ok(value) => value,
        Err(e) => {
            warn!("⚠️ [完成流水线] 处理器以失败结束: {}", e);
            error_payload()
        }
    };

    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            warn!("⚠️ [完成流水线] 结果序列化失败: {}", e);
            Bytes::from(error_payload().to_string())
        }
    }
}

/// 完成流水线
pub struct CompletionPipeline {
    connection: Arc<dyn TunnelConnection>,
    lifetime: Arc<Lifetime>,
    heartbeat: Arc<Heartbeat>,
    /// 等待最后一次心跳的上限
    heartbeat_wait: Duration,
}

impl CompletionPipeline {
    pub fn new(
        connection: Arc<dyn TunnelConnection>,
        lifetime: Arc<Lifetime>,
        heartbeat: Arc<Heartbeat>,
        heartbeat_wait: Duration,
    ) -> Self {
        Self {
            connection,
            lifetime,
            heartbeat,
            heartbeat_wait,
        }
    }

    /// 等待完成信号并收尾
    ///
    /// 会话先被结束时不再等待处理器，直接丢弃，之后才到的结果被忽略。
    pub async fn run(self, signal: CompletionSignal) -> SessionEnd {
        tokio::select! {
            biased;
            outcome = signal.wait() => self.finish(outcome).await,
            _ = self.lifetime.disposed() => self.discard().await,
        }
    }

    /// 用给定结果收尾
    pub async fn finish(&self, outcome: HandlerOutcome) -> SessionEnd {
        // 心跳的取消也可能已经由生命周期完成，stop 对此幂等
        self.heartbeat.stop(self.heartbeat_wait).await;

        if self.lifetime.is_disposed() {
            return self.discard().await;
        }

        let payload = render_payload(outcome);
        let written = async {
            self.connection.write(payload).await?;
            self.connection.finish().await
        }
        .await;

        self.lifetime.dispose();

        match written {
            Ok(()) => {
                debug!("✅ [完成流水线] {} 已写出最终结果", self.lifetime);
                SessionEnd::Delivered
            }
            Err(e) => {
                warn!("⚠️ [完成流水线] {} 写出最终结果失败: {}", self.lifetime, e);
                SessionEnd::WriteFailed
            }
        }
    }

    async fn discard(&self) -> SessionEnd {
        self.heartbeat.stop(self.heartbeat_wait).await;
        debug!("🔌 [完成流水线] {} 已结束，丢弃结果并关闭连接", self.lifetime);
        self.connection.close();
        SessionEnd::Discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::{ConnEvent, RecordingConnection};

    fn pipeline_for(
        conn: &Arc<RecordingConnection>,
        interval: Duration,
    ) -> (CompletionPipeline, Arc<Lifetime>, Arc<Heartbeat>) {
        let lifetime = Lifetime::new("pipeline");
        let closer = conn.clone();
        lifetime.register_cleanup(move || closer.close());
        let heartbeat = Heartbeat::start(conn.clone(), lifetime.clone(), interval);
        let pipeline = CompletionPipeline::new(
            conn.clone(),
            lifetime.clone(),
            heartbeat.clone(),
            interval * 2,
        );
        (pipeline, lifetime, heartbeat)
    }

    #[test]
    fn test_second_delivery_is_ignored() {
        let (callback, signal) = completion_signal("twice");
        assert!(callback.complete(json!({"n": 1})));
        assert!(callback.is_completed());
        assert!(!callback.complete(json!({"n": 2})));
        assert!(!callback.clone().fail("late"));

        let outcome = tokio_test::block_on(signal.wait()).unwrap();
        assert_eq!(outcome, json!({"n": 1}));
    }

    #[test]
    fn test_dropped_callback_is_failure() {
        let (callback, signal) = completion_signal("dropped");
        let clone = callback.clone();
        drop(callback);
        drop(clone);

        let outcome = tokio_test::block_on(signal.wait());
        assert!(matches!(outcome, Err(TunnelError::HandlerFailure(_))));
    }

    #[test]
    fn test_render_payload() {
        assert_eq!(&render_payload(Ok(json!({"x": 1})))[..], br#"{"x":1}"#);
        assert_eq!(
            &render_payload(Err(TunnelError::HandlerFailure("boom".into())))[..],
            br#"{"status":"error"}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_payload_is_last_write() {
        let conn = RecordingConnection::new();
        let (pipeline, lifetime, heartbeat) = pipeline_for(&conn, Duration::from_millis(100));
        let (callback, signal) = completion_signal("ordered");

        let task = tokio::spawn(pipeline.run(signal));
        tokio::time::sleep(Duration::from_millis(250)).await;
        callback.complete(json!({"done": true}));

        assert_eq!(task.await.unwrap(), SessionEnd::Delivered);
        assert!(lifetime.is_disposed());
        assert_eq!(heartbeat.beats(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let events = conn.events();
        assert_eq!(
            events,
            vec![
                ConnEvent::Write(Bytes::from_static(b" ")),
                ConnEvent::Write(Bytes::from_static(b" ")),
                ConnEvent::Write(Bytes::from_static(br#"{"done":true}"#)),
                ConnEvent::Finish,
                ConnEvent::Close,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_out_in_flight_heartbeat() {
        let conn = RecordingConnection::slow(Duration::from_millis(50));
        let (pipeline, _lifetime, _heartbeat) = pipeline_for(&conn, Duration::from_millis(100));
        let (callback, signal) = completion_signal("in-flight");

        let task = tokio::spawn(pipeline.run(signal));
        // 心跳在 100ms 开始写，150ms 写完；结果在 120ms 到达
        tokio::time::sleep(Duration::from_millis(120)).await;
        callback.complete(json!(1));

        assert_eq!(task.await.unwrap(), SessionEnd::Delivered);
        let writes: Vec<_> = conn
            .events()
            .into_iter()
            .filter(|e| matches!(e, ConnEvent::Write(_)))
            .collect();
        assert_eq!(
            writes,
            vec![
                ConnEvent::Write(Bytes::from_static(b" ")),
                ConnEvent::Write(Bytes::from_static(b"1")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_after_disconnect_only_closes() {
        let conn = RecordingConnection::new();
        let (pipeline, lifetime, _heartbeat) = pipeline_for(&conn, Duration::from_millis(100));
        let (callback, signal) = completion_signal("late");

        let task = tokio::spawn(pipeline.run(signal));
        conn.disconnect();
        lifetime.dispose();
        callback.complete(json!({"too": "late"}));

        assert_eq!(task.await.unwrap(), SessionEnd::Discarded);
        assert!(conn.payload_writes().is_empty());
        assert!(conn.events().contains(&ConnEvent::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposal_ends_pipeline_while_handler_holds_callback() {
        let conn = RecordingConnection::new();
        let (pipeline, lifetime, heartbeat) = pipeline_for(&conn, Duration::from_millis(100));
        let (callback, signal) = completion_signal("held");

        let task = tokio::spawn(pipeline.run(signal));
        tokio::time::sleep(Duration::from_millis(150)).await;
        conn.disconnect();
        lifetime.dispose();

        let end = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("会话结束后流水线不应继续等待处理器")
            .unwrap();
        assert_eq!(end, SessionEnd::Discarded);
        assert!(heartbeat.is_cancelled());
        assert!(conn.events().contains(&ConnEvent::Close));

        // 处理器仍持有回调，之后交付也不会写出任何内容
        assert!(!callback.is_completed());
        callback.complete(json!({"too": "late"}));
        assert!(conn.payload_writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failure_writes_error_document() {
        let conn = RecordingConnection::new();
        let (pipeline, lifetime, _heartbeat) = pipeline_for(&conn, Duration::from_millis(100));
        let (callback, signal) = completion_signal("failing");

        callback.fail("handler exploded");
        assert_eq!(pipeline.run(signal).await, SessionEnd::Delivered);
        assert_eq!(
            conn.payload_writes(),
            vec![Bytes::from_static(br#"{"status":"error"}"#)]
        );
        assert!(lifetime.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_still_disposes() {
        let conn = RecordingConnection::failing_from(1);
        let (pipeline, lifetime, _heartbeat) = pipeline_for(&conn, Duration::from_millis(100));

        assert_eq!(pipeline.finish(Ok(json!({}))).await, SessionEnd::WriteFailed);
        assert!(lifetime.is_disposed());
    }
}
