//! 请求分发器
//!
//! 每个进入的请求按以下顺序处理：
//!
//! 1. 读取请求体之前完成校验，失败时返回裸 404，不创建生命周期；
//! 2. 读取并解析 JSON 请求体，查找处理器并同步解析参数，失败时返回裸 400；
//! 3. 立即返回 200 分块响应头，响应体由 [`ChannelConnection`] 驱动；
//! 4. hyper 第一次轮询响应体（响应头已写入连接）后才创建会话生命周期：
//!    先注册连接关闭动作，再启动对端断开监视与心跳；
//! 5. 把处理器执行提交到工作线程池，完成流水线在运行时上等待结果。
//!
//! 响应体未被轮询就被丢弃（连接在写出响应头前断开）时，不创建生命周期，
//! 处理器也不会执行。

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{
    AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, HeaderValue, LAST_MODIFIED, SERVER,
    TRANSFER_ENCODING, X_CONTENT_TYPE_OPTIONS,
};
use hyper::{Request, Response, StatusCode};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{TunnelError, TunnelResult};
use crate::server::config::{TunnelConfig, io_timeout_for};
use crate::server::streaming::{ChannelConnection, TunnelBody, status_response};
use crate::server::worker_pool::WorkerPool;
use crate::tunnel::completion::{CompletionPipeline, SessionEnd, completion_signal};
use crate::tunnel::connection::TunnelConnection;
use crate::tunnel::handler::ParsedRequest;
use crate::tunnel::heartbeat::Heartbeat;
use crate::tunnel::lifetime::Lifetime;
use crate::tunnel::registry::HandlerRegistry;
use crate::tunnel::validator::RequestValidator;
use crate::utils::logger::{debug, error, warn};

/// 请求体中覆盖心跳间隔的字段（毫秒）
pub const HEARTBEAT_FIELD: &str = "heartbeatMillis";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const NO_CACHE: &str = "private, must-revalidate";
const SERVER_NAME: &str = concat!("rat_tunnel/", env!("CARGO_PKG_VERSION"));

/// 请求分发器
pub struct Dispatcher {
    config: Arc<TunnelConfig>,
    registry: Arc<HandlerRegistry>,
    validator: RequestValidator,
    launcher: Arc<SessionLauncher>,
}

impl Dispatcher {
    /// 创建分发器并启动工作线程池
    pub fn new(config: TunnelConfig, registry: HandlerRegistry) -> TunnelResult<Self> {
        config.validate()?;
        let launcher = Arc::new(SessionLauncher {
            workers: WorkerPool::new("toolbox-worker", config.worker_threads)?,
            started: AtomicU64::new(0),
        });
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let validator = RequestValidator::new(config.clone(), registry.clone());

        Ok(Self {
            config,
            registry,
            validator,
            launcher,
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// 已启动的会话数量（每个会话对应一个生命周期）
    pub fn sessions_started(&self) -> u64 {
        self.launcher.started.load(Ordering::Acquire)
    }

    /// 处理一个请求，总是返回响应
    pub async fn handle<B>(&self, req: Request<B>) -> Response<TunnelBody>
    where
        B: Body,
        B::Error: Display,
    {
        match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    TunnelError::BadRequest(_) => warn!("⚠️ [分发器] 拒绝请求: {}", e),
                    _ => debug!("🚫 [分发器] 拒绝请求: {}", e),
                }
                status_response(e.status_code())
            }
        }
    }

    async fn dispatch<B>(&self, req: Request<B>) -> TunnelResult<Response<TunnelBody>>
    where
        B: Body,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path();
        let authorization = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        self.validator.validate(&parts.method, path, authorization)?;

        let bytes = body
            .collect()
            .await
            .map_err(|e| TunnelError::BadRequest(format!("读取请求体失败: {}", e)))?
            .to_bytes();
        let request: Value = serde_json::from_slice(&bytes)
            .map_err(|e| TunnelError::BadRequest(format!("请求体不是合法的 JSON: {}", e)))?;

        let heartbeat = self.heartbeat_for(&request)?;
        let handler = self.registry.lookup(path)?;
        let parsed = handler.prepare(&request)?;

        let (connection, body) = ChannelConnection::new(io_timeout_for(heartbeat));
        debug!("🚀 [分发器] 接受请求 {}，心跳间隔 {:?}", path, heartbeat);
        launch_when_opened(self.launcher.clone(), connection, parsed, heartbeat);

        Ok(tunnel_response(body))
    }

    /// 请求体中的心跳覆盖值，缺省时使用配置的间隔
    fn heartbeat_for(&self, request: &Value) -> TunnelResult<Duration> {
        match request.get(HEARTBEAT_FIELD) {
            None | Some(Value::Null) => Ok(self.config.heartbeat),
            Some(value) => value
                .as_u64()
                .filter(|millis| *millis > 0)
                .map(Duration::from_millis)
                .ok_or_else(|| {
                    TunnelError::BadRequest(format!("{} 必须是正整数: {}", HEARTBEAT_FIELD, value))
                }),
        }
    }

    /// 在给定连接上立即启动会话
    ///
    /// 需要在 tokio 运行时中调用。
    pub fn start_session(
        &self,
        connection: Arc<dyn TunnelConnection>,
        parsed: ParsedRequest,
        interval: Duration,
    ) -> SessionHandle {
        self.launcher.launch(connection, parsed, interval)
    }
}

/// 会话启动器，持有工作线程池
struct SessionLauncher {
    workers: WorkerPool,
    started: AtomicU64,
}

impl SessionLauncher {
    fn launch(
        &self,
        connection: Arc<dyn TunnelConnection>,
        parsed: ParsedRequest,
        interval: Duration,
    ) -> SessionHandle {
        self.started.fetch_add(1, Ordering::AcqRel);
        let lifetime = Lifetime::new(format!("toolbox:{}", parsed.name()));

        // 最先注册，最后执行：心跳总是先于连接关闭被取消
        let closer = connection.clone();
        lifetime.register_cleanup(move || closer.close());
        spawn_disconnect_watcher(connection.clone(), lifetime.clone());

        let heartbeat = Heartbeat::start(connection.clone(), lifetime.clone(), interval);

        let (callback, signal) = completion_signal(lifetime.to_string());
        let pipeline = CompletionPipeline::new(
            connection,
            lifetime.clone(),
            heartbeat.clone(),
            io_timeout_for(interval),
        );
        let completion = tokio::spawn(pipeline.run(signal));

        let worker_lifetime = lifetime.clone();
        let worker_callback = callback.clone();
        if let Err(e) = self
            .workers
            .execute(move || parsed.execute(worker_lifetime, worker_callback))
        {
            error!("❌ [分发器] 提交处理器任务失败: {}", e);
            callback.fail(e.to_string());
        }

        SessionHandle {
            lifetime,
            heartbeat,
            completion,
        }
    }
}

/// 等 hyper 写出响应头后再启动会话；响应体未被轮询就被丢弃时放弃请求
fn launch_when_opened(
    launcher: Arc<SessionLauncher>,
    connection: Arc<ChannelConnection>,
    parsed: ParsedRequest,
    interval: Duration,
) {
    tokio::spawn(async move {
        let opened = tokio::select! {
            biased;
            _ = connection.opened() => true,
            _ = connection.closed() => false,
        };
        if opened {
            launcher.launch(connection, parsed, interval);
        } else {
            debug!("🔌 [分发器] 响应头写出前连接已关闭，放弃请求 {}", parsed.name());
        }
    });
}

/// 对端断开时释放生命周期；生命周期先被释放则直接退出
fn spawn_disconnect_watcher(connection: Arc<dyn TunnelConnection>, lifetime: Arc<Lifetime>) {
    tokio::spawn(async move {
        tokio::select! {
            _ = connection.closed() => {
                if lifetime.dispose() {
                    debug!("🔌 [分发器] {} 的连接已关闭，结束会话", lifetime);
                }
            }
            _ = lifetime.disposed() => {}
        }
    });
}

fn tunnel_response(body: TunnelBody) -> Response<TunnelBody> {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
        headers.insert(LAST_MODIFIED, value);
    }
    response
}

/// 已启动会话的句柄
pub struct SessionHandle {
    lifetime: Arc<Lifetime>,
    heartbeat: Arc<Heartbeat>,
    completion: JoinHandle<SessionEnd>,
}

impl SessionHandle {
    pub fn lifetime(&self) -> &Arc<Lifetime> {
        &self.lifetime
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    /// 等待完成流水线结束
    pub async fn finished(self) -> SessionEnd {
        match self.completion.await {
            Ok(end) => end,
            Err(e) => {
                error!("❌ [分发器] 完成流水线异常结束: {}", e);
                SessionEnd::Discarded
            }
        }
    }
}
