//! 会话连接抽象
//!
//! 心跳调度器与完成流水线都只通过 [`TunnelConnection`] 写数据。两者的写入
//! 在时间上互斥（心跳先停止并等待结束，完成流水线才写入），因此连接本身
//! 不需要额外的锁。

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TunnelResult;

/// 心跳帧：单个空格，JSON 解析器会把它当作前导空白忽略
pub const HEARTBEAT_FRAME: &[u8] = b" ";

/// 承载一个分块响应体的连接
#[async_trait]
pub trait TunnelConnection: Send + Sync + 'static {
    /// 写入一个数据块并刷新，返回写入结果
    async fn write(&self, chunk: Bytes) -> TunnelResult<()>;

    /// 正常结束分块流（写出终止块）
    async fn finish(&self) -> TunnelResult<()>;

    /// 中止连接，不写出终止块；对已结束的连接无效
    fn close(&self);

    /// 连接是否已经关闭（对端断开、中止或正常结束）
    fn is_closed(&self) -> bool;

    /// 等待连接关闭
    async fn closed(&self);
}
