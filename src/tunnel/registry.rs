//! 处理器注册表
//!
//! 服务启动前注册，之后只读共享。查找按请求路径的后缀匹配：路径以
//! `/<请求名>` 结尾即命中，多个名字同时命中时先注册的优先。

use std::sync::Arc;

use serde_json::Value;

use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::completion::ResultCallback;
use crate::tunnel::handler::{FnHandler, RegisteredHandler, ToolboxHandler};
use crate::tunnel::lifetime::Lifetime;
use crate::utils::logger::info;

/// 处理器注册表
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器
    ///
    /// 请求名两端的 `/` 会被去掉；去掉后为空或与已注册的名字重复都是错误。
    pub fn register<H: ToolboxHandler>(&mut self, handler: H) -> TunnelResult<&mut Self> {
        let name = normalize_name(handler.request_name());
        if name.is_empty() {
            return Err(TunnelError::Config(format!(
                "处理器请求名无效: '{}'",
                handler.request_name()
            )));
        }
        if self.handlers.iter().any(|h| h.name() == name) {
            return Err(TunnelError::DuplicateHandler(name));
        }

        info!("📝 [注册表] 注册处理器: {}", name);
        self.handlers.push(RegisteredHandler::new(&name, handler));
        Ok(self)
    }

    /// 用解析函数与执行函数注册处理器
    pub fn register_fn<P, Parse, Exec>(
        &mut self,
        name: impl Into<String>,
        parse: Parse,
        exec: Exec,
    ) -> TunnelResult<&mut Self>
    where
        P: Send + 'static,
        Parse: Fn(&Value) -> TunnelResult<P> + Send + Sync + 'static,
        Exec: Fn(Arc<Lifetime>, P, ResultCallback) + Send + Sync + 'static,
    {
        self.register(FnHandler::new(name, parse, exec))
    }

    /// 按请求路径查找处理器，查询串不参与匹配
    pub fn lookup(&self, path: &str) -> TunnelResult<RegisteredHandler> {
        let path = strip_query(path);
        self.handlers
            .iter()
            .find(|h| matches_suffix(path, h.name()))
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        let path = strip_query(path);
        self.handlers.iter().any(|h| matches_suffix(path, h.name()))
    }

    /// 已注册的请求名，按注册顺序
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_matches('/').to_string()
}

pub(crate) fn strip_query(path: &str) -> &str {
    path.split_once('?').map_or(path, |(p, _)| p)
}

fn matches_suffix(path: &str, name: &str) -> bool {
    path.strip_suffix(name)
        .is_some_and(|prefix| prefix.ends_with('/'))
}
