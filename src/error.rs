//! RAT Tunnel 错误类型
//!
//! 预分发阶段的错误（NotFound / Unauthorized / BadRequest）直接映射为裸状态码；
//! 响应头提交之后的错误只会以 `{"status":"error"}` 的形式出现在最终数据块中。

use hyper::StatusCode;
use thiserror::Error;

/// 隧道错误
#[derive(Debug, Error)]
pub enum TunnelError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 重复注册的处理器
    #[error("处理器已注册: {0}")]
    DuplicateHandler(String),

    /// 没有匹配的处理器
    #[error("未找到处理器: {0}")]
    NotFound(String),

    /// 凭证缺失或不匹配（不暴露具体原因）
    #[error("未授权的请求")]
    Unauthorized,

    /// 请求参数解析失败
    #[error("请求错误: {0}")]
    BadRequest(String),

    /// 处理器执行失败
    #[error("处理器执行失败: {0}")]
    HandlerFailure(String),

    /// 连接写入失败（心跳或最终数据块）
    #[error("传输错误: {0}")]
    Transport(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP错误: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML解析错误: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TunnelError {
    /// 预分发阶段错误对应的 HTTP 状态码
    ///
    /// 授权失败与处理器不存在都返回 404，调用方无法区分是哪一项检查失败。
    pub fn status_code(&self) -> StatusCode {
        match self {
            TunnelError::NotFound(_) | TunnelError::Unauthorized => StatusCode::NOT_FOUND,
            TunnelError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

/// 把 `catch_unwind` 捕获到的 panic 负载转换为可读文本
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
