//! 会话生命周期
//!
//! 一个会话（一次被接受的请求）对应一个 [`Lifetime`]。它持有按注册顺序排列的
//! 清理动作，并保证：
//!
//! - `dispose()` 可以从任意线程、任意次数调用，清理动作最多执行一次；
//! - 清理动作按注册的逆序执行（后注册的先执行），心跳在连接关闭之前被取消；
//! - 已释放后再注册的清理动作会被立即同步执行，不会被静默丢弃。
//!
//! 对端断开、心跳失败、处理器完成这三条终止路径都汇聚到这里。

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::error::panic_message;
use crate::utils::logger::{debug, error};

type CleanupAction = Box<dyn FnOnce() + Send + 'static>;

static LIFETIME_COUNTER: AtomicU64 = AtomicU64::new(1);

/// 一次性资源作用域
pub struct Lifetime {
    id: u64,
    label: String,
    disposed: AtomicBool,
    cleanups: Mutex<Vec<CleanupAction>>,
    notify: Notify,
}

impl Lifetime {
    /// 创建处于活跃状态的生命周期
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let lifetime = Arc::new(Self {
            id: LIFETIME_COUNTER.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            disposed: AtomicBool::new(false),
            cleanups: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        debug!("🌱 [生命周期] 创建: {}", lifetime);
        lifetime
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 非阻塞查询，可在任意线程调用
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// 注册清理动作
    ///
    /// 已释放时动作在当前线程立即执行，返回 `false`；否则排队等待释放，返回 `true`。
    pub fn register_cleanup<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(PoisonError::into_inner);
        // 在锁内检查标志：dispose() 置位后一定会在同一把锁下取走队列
        if self.is_disposed() {
            drop(cleanups);
            debug!("⚡ [生命周期] {} 已释放，立即执行清理动作", self);
            run_cleanup(self, Box::new(action));
            return false;
        }
        cleanups.push(Box::new(action));
        true
    }

    /// 释放生命周期
    ///
    /// 只有第一个完成 active -> disposed 切换的调用者会执行清理动作并返回 `true`，
    /// 其余并发调用者立即返回 `false`。
    pub fn dispose(&self) -> bool {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let actions = {
            let mut cleanups = self.cleanups.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *cleanups)
        };

        debug!("🧹 [生命周期] 释放 {}，执行 {} 个清理动作", self, actions.len());
        for action in actions.into_iter().rev() {
            run_cleanup(self, action);
        }

        self.notify.notify_waiters();
        true
    }

    /// 等待生命周期被释放
    pub async fn disposed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_disposed() {
                return;
            }
            notified.await;
        }
    }

    /// 待执行的清理动作数量
    pub fn pending_cleanups(&self) -> usize {
        self.cleanups.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn run_cleanup(lifetime: &Lifetime, action: CleanupAction) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
        error!(
            "❌ [生命周期] {} 的清理动作 panic: {}",
            lifetime,
            panic_message(payload.as_ref())
        );
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
