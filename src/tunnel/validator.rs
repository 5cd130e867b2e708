//! 请求校验
//!
//! 在读取请求体之前执行。只有同时满足以下条件才放行：
//! 服务端配置了共享密钥、`Authorization` 头等于 `<scheme> <token>`、
//! 路径位于服务挂载路径下且有处理器匹配、方法为 POST。
//! 任何一项失败都只返回结论，不说明是哪一项。

use std::sync::Arc;

use hyper::Method;

use crate::error::{TunnelError, TunnelResult};
use crate::server::config::TunnelConfig;
use crate::tunnel::registry::{HandlerRegistry, strip_query};
use crate::utils::logger::debug;

/// 校验结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Authorized,
    /// 凭证缺失或不匹配
    Unauthorized,
    /// 路径、处理器或方法不受支持
    Unsupported,
}

impl Verdict {
    pub fn is_authorized(self) -> bool {
        self == Verdict::Authorized
    }

    /// 转换为结果，失败时带上对应的错误
    pub fn into_result(self, path: &str) -> TunnelResult<()> {
        match self {
            Verdict::Authorized => Ok(()),
            Verdict::Unauthorized => Err(TunnelError::Unauthorized),
            Verdict::Unsupported => Err(TunnelError::NotFound(path.to_string())),
        }
    }
}

/// 请求校验器
#[derive(Clone)]
pub struct RequestValidator {
    config: Arc<TunnelConfig>,
    registry: Arc<HandlerRegistry>,
}

impl RequestValidator {
    pub fn new(config: Arc<TunnelConfig>, registry: Arc<HandlerRegistry>) -> Self {
        Self { config, registry }
    }

    /// 校验方法、路径与凭证
    pub fn check(&self, method: &Method, path: &str, authorization: Option<&str>) -> Verdict {
        let Some(expected) = self.config.expected_authorization() else {
            debug!("🔒 [校验] 未配置共享密钥，拒绝请求: {}", path);
            return Verdict::Unauthorized;
        };
        if authorization != Some(expected.as_str()) {
            debug!("🔒 [校验] 凭证不匹配，拒绝请求: {}", path);
            return Verdict::Unauthorized;
        }

        if !self.is_under_base_path(path) || !self.registry.contains(path) {
            debug!("🔍 [校验] 没有匹配的处理器: {}", path);
            return Verdict::Unsupported;
        }
        if *method != Method::POST {
            debug!("🚫 [校验] 不支持的方法 {}: {}", method, path);
            return Verdict::Unsupported;
        }

        Verdict::Authorized
    }

    /// 校验并转换为结果
    pub fn validate(&self, method: &Method, path: &str, authorization: Option<&str>) -> TunnelResult<()> {
        self.check(method, path, authorization).into_result(path)
    }

    fn is_under_base_path(&self, path: &str) -> bool {
        let base = self.config.base_path.trim_end_matches('/');
        strip_query(path)
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
    }
}
