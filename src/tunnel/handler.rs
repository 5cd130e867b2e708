//! 处理器契约
//!
//! 每个处理器声明自己的请求名，把 JSON 请求体解析成强类型参数，然后在工作线程上
//! 执行。执行函数应当尽快返回，稍后从任意线程通过 [`ResultCallback`] 交付结果。
//!
//! 注册表按名字保存类型擦除后的处理器；解析得到的 [`ParsedRequest`] 把参数与
//! 执行函数打包在一起，分发器不需要知道参数类型。

use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{TunnelError, TunnelResult, panic_message};
use crate::tunnel::completion::ResultCallback;
use crate::tunnel::lifetime::Lifetime;

/// Toolbox 处理器
pub trait ToolboxHandler: Send + Sync + 'static {
    /// 解析后的请求参数
    type Params: Send + 'static;

    /// 请求名，匹配 URL 路径的最后一段
    fn request_name(&self) -> &str;

    /// 把 JSON 请求体解析成参数；返回错误时请求以 400 拒绝
    fn parse_request(&self, request: &Value) -> TunnelResult<Self::Params>;

    /// 执行请求
    ///
    /// 在工作线程上调用。`lifetime` 在对端断开或会话结束时释放，可以在上面注册
    /// 清理动作。结果通过 `on_result` 交付一次。
    fn handle_request(&self, lifetime: Arc<Lifetime>, params: Self::Params, on_result: ResultCallback);
}

/// 由解析函数与执行函数组成的处理器
pub struct FnHandler<P, Parse, Exec> {
    name: String,
    parse: Parse,
    exec: Exec,
    _params: PhantomData<fn() -> P>,
}

impl<P, Parse, Exec> FnHandler<P, Parse, Exec>
where
    P: Send + 'static,
    Parse: Fn(&Value) -> TunnelResult<P> + Send + Sync + 'static,
    Exec: Fn(Arc<Lifetime>, P, ResultCallback) + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, parse: Parse, exec: Exec) -> Self {
        Self {
            name: name.into(),
            parse,
            exec,
            _params: PhantomData,
        }
    }
}

impl<P, Parse, Exec> ToolboxHandler for FnHandler<P, Parse, Exec>
where
    P: Send + 'static,
    Parse: Fn(&Value) -> TunnelResult<P> + Send + Sync + 'static,
    Exec: Fn(Arc<Lifetime>, P, ResultCallback) + Send + Sync + 'static,
{
    type Params = P;

    fn request_name(&self) -> &str {
        &self.name
    }

    fn parse_request(&self, request: &Value) -> TunnelResult<P> {
        (self.parse)(request)
    }

    fn handle_request(&self, lifetime: Arc<Lifetime>, params: P, on_result: ResultCallback) {
        (self.exec)(lifetime, params, on_result)
    }
}

type Execute = Box<dyn FnOnce(Arc<Lifetime>, ResultCallback) + Send>;

/// 类型擦除后的处理器
trait ErasedHandler: Send + Sync {
    fn prepare(&self, request: &Value) -> TunnelResult<Execute>;
}

struct TypedHandler<H>(Arc<H>);

impl<H: ToolboxHandler> ErasedHandler for TypedHandler<H> {
    fn prepare(&self, request: &Value) -> TunnelResult<Execute> {
        let params = self.0.parse_request(request)?;
        let handler = self.0.clone();
        Ok(Box::new(move |lifetime, on_result| {
            handler.handle_request(lifetime, params, on_result)
        }))
    }
}

/// 注册表中的处理器
#[derive(Clone)]
pub struct RegisteredHandler {
    name: Arc<str>,
    inner: Arc<dyn ErasedHandler>,
}

impl RegisteredHandler {
    pub(crate) fn new<H: ToolboxHandler>(name: &str, handler: H) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(TypedHandler(Arc::new(handler))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 解析请求体
    ///
    /// 解析函数的错误和 panic 都转换成 `BadRequest`。
    pub fn prepare(&self, request: &Value) -> TunnelResult<ParsedRequest> {
        let prepared = catch_unwind(AssertUnwindSafe(|| self.inner.prepare(request)))
            .map_err(|payload| {
                TunnelError::BadRequest(format!(
                    "解析 {} 请求时发生 panic: {}",
                    self.name,
                    panic_message(payload.as_ref())
                ))
            })?;

        match prepared {
            Ok(execute) => Ok(ParsedRequest {
                name: self.name.clone(),
                execute,
            }),
            Err(TunnelError::BadRequest(msg)) => Err(TunnelError::BadRequest(msg)),
            Err(e) => Err(TunnelError::BadRequest(format!("{} 请求参数无效: {}", self.name, e))),
        }
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler").field("name", &self.name).finish()
    }
}

/// 已解析、等待执行的请求
pub struct ParsedRequest {
    name: Arc<str>,
    execute: Execute,
}

impl ParsedRequest {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 执行请求
    ///
    /// 执行函数中的 panic 被捕获并作为处理器失败交付。
    pub fn execute(self, lifetime: Arc<Lifetime>, on_result: ResultCallback) {
        let Self { name, execute } = self;
        let callback = on_result.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || execute(lifetime, callback))) {
            on_result.fail(format!(
                "{} 处理器发生 panic: {}",
                name,
                panic_message(payload.as_ref())
            ));
        }
    }
}

impl std::fmt::Debug for ParsedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ParsedRequest({})", self.name)
    }
}
