//! Toolbox 隧道演示
//!
//! 注册两个处理器：
//! - `echo`：立即返回请求体
//! - `sleep`：在工作线程上休眠 `millis` 毫秒后返回，用来观察心跳
//!
//! ```bash
//! cargo run --example toolbox_echo -- --token secret --heartbeat-millis 500
//! curl -N -X POST -H 'Authorization: toolbox secret' \
//!      -d '{"millis": 2000}' http://127.0.0.1:63342/api/toolbox/sleep
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use rat_tunnel::{
    HandlerRegistry, Lifetime, ResultCallback, TunnelConfig, TunnelResult, TunnelServer, Value,
    json,
};

#[derive(Parser, Debug)]
#[command(name = "toolbox_echo", about = "Toolbox 隧道演示服务")]
struct Args {
    /// 共享密钥，缺省时读取 TOOLBOX_NOTIFICATION_TOKEN
    #[arg(long)]
    token: Option<String>,

    /// 默认心跳间隔（毫秒）
    #[arg(long)]
    heartbeat_millis: Option<u64>,

    /// 监听地址
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// TOML 配置文件
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    millis: u64,
}

#[tokio::main]
async fn main() -> TunnelResult<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TunnelConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => TunnelConfig::from_env()?,
    };
    if let Some(token) = args.token {
        config = config.with_token(token);
    }
    if let Some(millis) = args.heartbeat_millis {
        config = config.with_heartbeat(Duration::from_millis(millis));
    }
    if let Some(bind) = args.bind {
        config = config.with_bind_addr(bind);
    }
    if config.token.is_none() {
        println!("⚠️  未配置共享密钥，所有请求都会被拒绝");
    }

    let mut registry = HandlerRegistry::new();
    registry
        .register_fn(
            "echo",
            |req: &Value| -> TunnelResult<Value> { Ok(req.clone()) },
            |_: Arc<Lifetime>, req: Value, done: ResultCallback| {
                done.complete(req);
            },
        )?
        .register_fn(
            "sleep",
            |req: &Value| -> TunnelResult<SleepParams> { Ok(serde_json::from_value(req.clone())?) },
            |lifetime: Arc<Lifetime>, params: SleepParams, done: ResultCallback| {
                // 模拟长耗时任务；连接断开后结果会被丢弃
                std::thread::sleep(Duration::from_millis(params.millis));
                done.complete(json!({
                    "slept": params.millis,
                    "disconnected": lifetime.is_disposed(),
                }));
            },
        )?;

    let server = TunnelServer::bind(config, registry).await?;
    println!("🚀 Toolbox 隧道已启动: http://{}/api/toolbox", server.local_addr()?);
    println!("   按 Ctrl+C 停止");
    server.serve().await
}
