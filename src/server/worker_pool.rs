//! 处理器工作线程池
//!
//! 处理器的执行函数可能做阻塞工作，因此不在 tokio 运行时上执行，而是交给操作系统
//! 线程。线程池有固定数量的常驻线程；提交任务时没有空闲线程可接手就临时扩容，
//! 临时线程空闲超过保活时间后退出。一个长时间阻塞的处理器不会推迟其它会话的开始。
//!
//! 任务通过 crossbeam 通道分发；单个任务 panic 只记录日志，不影响工作线程继续
//! 处理后续任务。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::error::{TunnelError, TunnelResult, panic_message};
use crate::utils::logger::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 临时线程的默认保活时间
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

struct PoolShared {
    name: String,
    receiver: Receiver<Job>,
    keep_alive: Duration,
    /// 等待中的线程数减去排队中的任务数，小于等于 0 时新任务没有线程接手
    spare: AtomicIsize,
    live: AtomicUsize,
    active: AtomicUsize,
    next_index: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// 可扩容的工作线程池
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Mutex<Option<Sender<Job>>>,
}

impl WorkerPool {
    /// 创建线程池，`core` 个常驻线程，线程名为 `<name>-<序号>`
    pub fn new(name: impl Into<String>, core: usize) -> TunnelResult<Self> {
        Self::with_keep_alive(name, core, DEFAULT_KEEP_ALIVE)
    }

    /// 指定临时线程保活时间
    pub fn with_keep_alive(
        name: impl Into<String>,
        core: usize,
        keep_alive: Duration,
    ) -> TunnelResult<Self> {
        if core == 0 {
            return Err(TunnelError::Config("工作线程数必须大于 0".to_string()));
        }

        let (sender, receiver) = channel::unbounded::<Job>();
        let shared = Arc::new(PoolShared {
            name: name.into(),
            receiver,
            keep_alive,
            spare: AtomicIsize::new(0),
            live: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
            workers: Mutex::new(Vec::with_capacity(core)),
        });

        for _ in 0..core {
            spawn_worker(&shared, true)?;
        }

        info!("🧵 [工作线程池] {} 启动 {} 个常驻线程", shared.name, core);
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
        })
    }

    /// 提交任务
    pub fn execute<F>(&self, job: F) -> TunnelResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = guard.as_ref().ok_or_else(|| self.closed_error())?;
            sender.send(Box::new(job)).map_err(|_| self.closed_error())?;
        }

        if self.shared.spare.fetch_sub(1, Ordering::AcqRel) <= 0 {
            debug!("🧵 [工作线程池] {} 没有空闲线程，临时扩容", self.shared.name);
            if let Err(e) = spawn_worker(&self.shared, false) {
                // 任务仍在队列中，等现有线程空闲后执行
                error!("❌ [工作线程池] {} 扩容失败: {}", self.shared.name, e);
            }
        }
        Ok(())
    }

    /// 正在执行的任务数量
    pub fn active_jobs(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// 存活的工作线程数量（常驻 + 临时）
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// 停止接收新任务，并等待已排队的任务执行完
    ///
    /// 会阻塞当前线程，不要在异步任务中调用。
    pub fn shutdown(&self) {
        self.close();
        let workers: Vec<_> = self
            .shared
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("❌ [工作线程池] {} 的工作线程异常退出", self.shared.name);
            }
        }
        info!("🛑 [工作线程池] {} 已停止", self.shared.name);
    }

    fn close(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn closed_error(&self) -> TunnelError {
        TunnelError::Config(format!("工作线程池 {} 已关闭", self.shared.name))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // 只关闭通道，工作线程处理完剩余任务后自行退出
        self.close();
    }
}

fn spawn_worker(shared: &Arc<PoolShared>, core: bool) -> std::io::Result<()> {
    let thread_name = format!(
        "{}-{}",
        shared.name,
        shared.next_index.fetch_add(1, Ordering::Relaxed)
    );

    // 新线程在启动前就算作等待中
    shared.spare.fetch_add(1, Ordering::AcqRel);
    shared.live.fetch_add(1, Ordering::AcqRel);

    let worker_shared = shared.clone();
    let spawned = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || worker_loop(thread_name, worker_shared, core));

    match spawned {
        Ok(handle) => {
            let mut workers = shared.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.retain(|h| !h.is_finished());
            workers.push(handle);
            Ok(())
        }
        Err(e) => {
            shared.spare.fetch_sub(1, Ordering::AcqRel);
            shared.live.fetch_sub(1, Ordering::AcqRel);
            Err(e)
        }
    }
}

fn worker_loop(name: String, shared: Arc<PoolShared>, core: bool) {
    debug!("🧵 [工作线程池] {} 就绪", name);
    let mut counted = true;
    loop {
        if !counted {
            shared.spare.fetch_add(1, Ordering::AcqRel);
        }
        counted = false;

        let received = if core {
            shared
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            shared.receiver.recv_timeout(shared.keep_alive)
        };

        match received {
            Ok(job) => run_job(&name, &shared, job),
            Err(RecvTimeoutError::Timeout) => {
                // 有排队任务正指望本线程时不能退出
                if shared.spare.fetch_sub(1, Ordering::AcqRel) > 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
    debug!("🧵 [工作线程池] {} 退出", name);
}

fn run_job(name: &str, shared: &PoolShared, job: Job) {
    shared.active.fetch_add(1, Ordering::AcqRel);
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        error!(
            "❌ [工作线程池] {} 执行任务时发生 panic: {}",
            name,
            panic_message(payload.as_ref())
        );
    }
    shared.active.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_runs_jobs_on_named_threads() {
        let pool = WorkerPool::new("unit-worker", 2).unwrap();
        assert_eq!(pool.live_workers(), 2);

        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.execute(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((i, name)).unwrap();
            })
            .unwrap();
        }

        let mut seen: Vec<_> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_by_key(|(i, _)| *i);
        assert_eq!(seen.len(), 8);
        for (_, name) in seen {
            assert!(name.unwrap().starts_with("unit-worker-"));
        }
        pool.shutdown();
    }

    #[test]
    fn test_blocked_job_does_not_delay_next_job() {
        let pool = WorkerPool::new("blocked", 1).unwrap();

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.execute(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(10));
        })
        .unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        pool.execute(move || done_tx.send(()).unwrap()).unwrap();
        assert!(
            done_rx.recv_timeout(Duration::from_millis(500)).is_ok(),
            "常驻线程被阻塞时新任务应由临时线程执行"
        );
        assert!(pool.live_workers() >= 2);

        gate_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_extra_workers_retire_after_keep_alive() {
        let pool = WorkerPool::with_keep_alive("retire", 1, Duration::from_millis(50)).unwrap();

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.execute(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(10));
        })
        .unwrap();
        let (done_tx, done_rx) = mpsc::channel();
        pool.execute(move || done_tx.send(()).unwrap()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        gate_tx.send(()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.live_workers() > 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(pool.live_workers(), 1, "临时线程应在保活时间后退出");

        // 退出后仍能继续扩容执行任务
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("panicky", 1).unwrap();
        pool.execute(|| panic!("job exploded")).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.shutdown();
    }

    #[test]
    fn test_execute_after_shutdown_fails() {
        let pool = WorkerPool::new("closed", 1).unwrap();
        pool.shutdown();
        assert!(matches!(pool.execute(|| {}), Err(TunnelError::Config(_))));
        assert_eq!(pool.live_workers(), 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(WorkerPool::new("empty", 0), Err(TunnelError::Config(_))));
    }
}
