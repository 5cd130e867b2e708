//! 日志工具
//!
//! 统一使用 rat_logger 的日志宏。全局日志器的安装由嵌入方负责，
//! 本库只负责输出。

pub use rat_logger::{debug, error, info, warn};
