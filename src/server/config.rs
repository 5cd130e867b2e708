//! 隧道配置
//!
//! 共享密钥与默认心跳间隔在进程启动时读取一次，之后以 `Arc<TunnelConfig>`
//! 的形式注入各组件，不在运行期间再访问环境变量。

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{TunnelError, TunnelResult};

/// 共享密钥环境变量
pub const TOKEN_ENV: &str = "TOOLBOX_NOTIFICATION_TOKEN";
/// 默认心跳间隔环境变量（毫秒）
pub const HEARTBEAT_ENV: &str = "TOOLBOX_HEARTBEAT_MILLIS";
/// 工作线程数环境变量
pub const WORKERS_ENV: &str = "TOOLBOX_WORKER_THREADS";
/// 监听地址环境变量
pub const BIND_ENV: &str = "TOOLBOX_BIND_ADDR";

pub const DEFAULT_HEARTBEAT_MILLIS: u64 = 5000;
pub const DEFAULT_AUTH_SCHEME: &str = "toolbox";
pub const DEFAULT_BASE_PATH: &str = "/api/toolbox";

/// 隧道配置
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// 共享密钥，未配置时拒绝所有请求
    pub token: Option<String>,
    /// 默认心跳间隔
    pub heartbeat: Duration,
    /// Authorization 头的前缀（`<scheme> <token>`）
    pub auth_scheme: String,
    /// 服务挂载路径
    pub base_path: String,
    /// 处理器常驻工作线程数，繁忙时线程池临时扩容
    pub worker_threads: usize,
    /// 监听地址
    pub bind_addr: SocketAddr,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            token: None,
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MILLIS),
            auth_scheme: DEFAULT_AUTH_SCHEME.to_string(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            worker_threads: num_cpus::get().max(1),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 63342)),
        }
    }
}

/// TOML 文件中的原始配置，所有字段可选
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawTunnelConfig {
    token: Option<String>,
    heartbeat_millis: Option<u64>,
    auth_scheme: Option<String>,
    base_path: Option<String>,
    worker_threads: Option<usize>,
    bind_addr: Option<String>,
}

impl TunnelConfig {
    /// 从环境变量读取配置，未设置的项使用默认值
    pub fn from_env() -> TunnelResult<Self> {
        let mut config = Self::default();

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }
        if let Ok(millis) = std::env::var(HEARTBEAT_ENV) {
            let millis: u64 = millis.trim().parse().map_err(|e| {
                TunnelError::Config(format!("{} 不是合法的毫秒数: {}", HEARTBEAT_ENV, e))
            })?;
            config.heartbeat = Duration::from_millis(millis);
        }
        if let Ok(workers) = std::env::var(WORKERS_ENV) {
            config.worker_threads = workers.trim().parse().map_err(|e| {
                TunnelError::Config(format!("{} 不是合法的线程数: {}", WORKERS_ENV, e))
            })?;
        }
        if let Ok(addr) = std::env::var(BIND_ENV) {
            config.bind_addr = parse_addr(&addr)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文本读取配置
    pub fn from_toml_str(content: &str) -> TunnelResult<Self> {
        let raw: RawTunnelConfig = toml::from_str(content)?;
        let mut config = Self::default();

        config.token = raw.token.filter(|t| !t.is_empty());
        if let Some(millis) = raw.heartbeat_millis {
            config.heartbeat = Duration::from_millis(millis);
        }
        if let Some(scheme) = raw.auth_scheme {
            config.auth_scheme = scheme;
        }
        if let Some(base_path) = raw.base_path {
            config.base_path = base_path;
        }
        if let Some(workers) = raw.worker_threads {
            config.worker_threads = workers;
        }
        if let Some(addr) = raw.bind_addr {
            config.bind_addr = parse_addr(&addr)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// 设置共享密钥
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// 设置默认心跳间隔
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// 设置 Authorization 前缀
    pub fn with_auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = scheme.into();
        self
    }

    /// 设置服务挂载路径
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// 设置常驻工作线程数
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// 设置监听地址
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// 校验配置
    pub fn validate(&self) -> TunnelResult<()> {
        if self.heartbeat.is_zero() {
            return Err(TunnelError::Config("心跳间隔必须大于 0".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(TunnelError::Config("工作线程数必须大于 0".to_string()));
        }
        if !self.base_path.starts_with('/') {
            return Err(TunnelError::Config(format!(
                "服务路径必须以 '/' 开头: {}",
                self.base_path
            )));
        }
        if self.auth_scheme.trim().is_empty() {
            return Err(TunnelError::Config("Authorization 前缀不能为空".to_string()));
        }
        Ok(())
    }

    /// 期望的 Authorization 头，未配置密钥时为 `None`
    pub fn expected_authorization(&self) -> Option<String> {
        self.token
            .as_ref()
            .map(|token| format!("{} {}", self.auth_scheme, token))
    }

    /// 连接级读写超时：心跳间隔的两倍，单次心跳丢失不会触发底层超时
    pub fn io_timeout(&self) -> Duration {
        io_timeout_for(self.heartbeat)
    }
}

/// 按心跳间隔计算读写超时
pub fn io_timeout_for(heartbeat: Duration) -> Duration {
    heartbeat.saturating_mul(2)
}

fn parse_addr(addr: &str) -> TunnelResult<SocketAddr> {
    addr.trim()
        .parse()
        .map_err(|e| TunnelError::Config(format!("无效的监听地址 '{}': {}", addr, e)))
}
