use crate::error::PoolError;
use crate::worker::job::JobResult;
use crate::worker::metrics::{MetricsSnapshot, PoolMetrics};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 工作池的业务处理器
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Job: Send + 'static;
    type Output: JobResult;

    async fn handle(&self, job: Self::Job, worker_id: usize) -> Self::Output;
}

/// 工作池参数
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// submit_sync 默认等待时长
    pub sync_timeout: Duration,
}

impl PoolConfig {
    /// 入库池默认值: 5 个 worker, 队列 100, 超时 5 分钟
    pub fn ingest_defaults() -> Self {
        Self {
            workers: 5,
            queue_capacity: 100,
            sync_timeout: Duration::from_secs(5 * 60),
        }
    }

    /// 导出池默认值: 3 个 worker, 队列 50, 超时 10 分钟
    pub fn export_defaults() -> Self {
        Self {
            workers: 3,
            queue_capacity: 50,
            sync_timeout: Duration::from_secs(10 * 60),
        }
    }

    /// 用默认值补齐非法的零值
    fn or_defaults(self, defaults: PoolConfig) -> Self {
        Self {
            workers: if self.workers == 0 { defaults.workers } else { self.workers },
            queue_capacity: if self.queue_capacity == 0 {
                defaults.queue_capacity
            } else {
                self.queue_capacity
            },
            sync_timeout: if self.sync_timeout.is_zero() {
                defaults.sync_timeout
            } else {
                self.sync_timeout
            },
        }
    }
}

/// 工作池生命周期: Created -> Started -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PoolState {
    Created = 0,
    Started = 1,
    Stopping = 2,
    Stopped = 3,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Created,
            1 => PoolState::Started,
            2 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }
}

struct Envelope<J, R> {
    job: J,
    reply: Option<oneshot::Sender<R>>,
}

type Queue<H> = Envelope<<H as JobHandler>::Job, <H as JobHandler>::Output>;

/// 有界队列 + 固定数量 worker 的通用工作池
pub struct WorkerPool<H: JobHandler> {
    name: &'static str,
    handler: Arc<H>,
    config: PoolConfig,
    state: AtomicU8,
    sender: RwLock<Option<mpsc::Sender<Queue<H>>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Queue<H>>>>,
    cancel: CancellationToken,
    metrics: Arc<PoolMetrics>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: JobHandler> WorkerPool<H> {
    pub fn new(name: &'static str, handler: H, config: PoolConfig, defaults: PoolConfig) -> Self {
        let config = config.or_defaults(defaults);
        let (sender, receiver) = mpsc::channel(config.queue_capacity);

        Self {
            name,
            handler: Arc::new(handler),
            config,
            state: AtomicU8::new(PoolState::Created as u8),
            sender: RwLock::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            cancel: CancellationToken::new(),
            metrics: Arc::new(PoolMetrics::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }

    pub fn sync_timeout(&self) -> Duration {
        self.config.sync_timeout
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn transition(&self, from: PoolState, to: PoolState) -> Result<(), PoolState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(PoolState::from_u8)
    }

    /// 启动 N 个 worker; 重复调用无效果
    pub fn start(&self) {
        if let Err(current) = self.transition(PoolState::Created, PoolState::Started) {
            warn!(pool = self.name, state = ?current, "start() ignored");
            return;
        }

        info!(
            pool = self.name,
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Starting worker pool"
        );

        let mut handles = self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for worker_id in 0..self.config.workers {
            handles.push(tokio::spawn(run_worker(
                self.name,
                worker_id,
                Arc::clone(&self.handler),
                Arc::clone(&self.receiver),
                self.cancel.clone(),
                Arc::clone(&self.metrics),
            )));
        }
    }

    /// 异步提交; 队列满时等待空位, 期间仍响应停机
    pub async fn submit(&self, job: H::Job) -> Result<(), PoolError> {
        self.enqueue(Envelope { job, reply: None }).await
    }

    /// 提交并等待结果. 超时只影响调用方, 已在执行的任务会继续完成, 结果被丢弃
    pub async fn submit_sync(
        &self,
        job: H::Job,
        timeout: Duration,
    ) -> Result<H::Output, PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Envelope { job, reply: Some(reply_tx) }).await?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(PoolError::Shutdown),
            // 发送端未应答即被丢弃: 任务在停机时被放弃
            reply = reply_rx => reply.map_err(|_| PoolError::Shutdown),
            _ = tokio::time::sleep(timeout) => {
                warn!(pool = self.name, timeout = ?timeout, "submit_sync deadline exceeded");
                Err(PoolError::DeadlineExceeded(timeout))
            }
        }
    }

    async fn enqueue(&self, envelope: Queue<H>) -> Result<(), PoolError> {
        match self.state() {
            PoolState::Started => {}
            PoolState::Created => return Err(PoolError::NotStarted),
            PoolState::Stopping | PoolState::Stopped => return Err(PoolError::Shutdown),
        }
        if self.cancel.is_cancelled() {
            return Err(PoolError::Shutdown);
        }

        let sender = self
            .sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(PoolError::Shutdown)?;

        match sender.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => return Err(PoolError::Shutdown),
            Err(TrySendError::Full(envelope)) => {
                debug!(pool = self.name, "job queue full, waiting for capacity");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(PoolError::Shutdown),
                    sent = sender.send(envelope) => sent.map_err(|_| PoolError::Shutdown)?,
                }
            }
        }

        self.metrics.record_submitted();
        Ok(())
    }

    /// 停机: 取消令牌, 关闭队列, 等待所有 worker 退出.
    /// 执行中的任务会完成; 仍在队列中的任务被丢弃 (不会在之后执行)
    pub async fn stop(&self) {
        match self.transition(PoolState::Started, PoolState::Stopping) {
            Ok(()) => {}
            Err(PoolState::Created) => {
                self.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
                self.cancel.cancel();
                self.sender.write().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
                return;
            }
            Err(current) => {
                debug!(pool = self.name, state = ?current, "stop() ignored");
                return;
            }
        }

        info!(pool = self.name, "Stopping worker pool");
        self.cancel.cancel();
        self.sender.write().unwrap_or_else(|poisoned| poisoned.into_inner()).take();

        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!(pool = self.name, error = %e, "worker task terminated abnormally");
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut abandoned = 0u64;
        while receiver.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(pool = self.name, abandoned, "queued jobs abandoned at shutdown");
            self.metrics.record_abandoned(abandoned);
        }

        self.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
        info!(pool = self.name, "Worker pool stopped");
    }
}

impl<H: JobHandler> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}

async fn run_worker<H: JobHandler>(
    pool: &'static str,
    worker_id: usize,
    handler: Arc<H>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Queue<H>>>>,
    cancel: CancellationToken,
    metrics: Arc<PoolMetrics>,
) {
    debug!(pool, worker_id, "worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(pool, worker_id, "worker stopping");
                break;
            }
            envelope = async { receiver.lock().await.recv().await } => envelope,
        };

        let Some(Envelope { job, reply }) = next else {
            debug!(pool, worker_id, "job queue closed");
            break;
        };

        let start = Instant::now();
        let handled = AssertUnwindSafe(handler.handle(job, worker_id)).catch_unwind().await;
        let mut output = match handled {
            Ok(output) => output,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(pool, worker_id, error = %message, "job handler panicked");
                H::Output::from_panic(message)
            }
        };
        output.set_duration(start.elapsed());
        metrics.record_result(output.is_success());

        if let Some(reply) = reply {
            if reply.send(output).is_err() {
                debug!(pool, worker_id, "result receiver gone, result discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc::UnboundedSender, Semaphore};

    #[derive(Debug)]
    enum Action {
        Succeed,
        Fail,
        Panic,
        /// 等待闸门放行
        Gate,
    }

    struct TestJob {
        id: u32,
        action: Action,
    }

    #[derive(Debug, Default)]
    struct TestOutput {
        id: u32,
        success: bool,
        error: Option<String>,
        duration: Duration,
    }

    impl JobResult for TestOutput {
        fn is_success(&self) -> bool {
            self.success
        }

        fn from_panic(message: String) -> Self {
            Self { error: Some(message), ..Self::default() }
        }

        fn set_duration(&mut self, duration: Duration) {
            self.duration = duration;
        }
    }

    struct TestHandler {
        gate: Arc<Semaphore>,
        started: UnboundedSender<u32>,
        executed: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        type Job = TestJob;
        type Output = TestOutput;

        async fn handle(&self, job: TestJob, _worker_id: usize) -> TestOutput {
            let _ = self.started.send(job.id);
            let success = match job.action {
                Action::Succeed => true,
                Action::Fail => false,
                Action::Panic => panic!("boom {}", job.id),
                Action::Gate => {
                    self.gate.acquire().await.unwrap().forget();
                    true
                }
            };
            self.executed.lock().unwrap().push(job.id);
            TestOutput { id: job.id, success, ..TestOutput::default() }
        }
    }

    struct Harness {
        pool: Arc<WorkerPool<TestHandler>>,
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedReceiver<u32>,
        executed: Arc<Mutex<Vec<u32>>>,
    }

    fn harness(workers: usize, queue_capacity: usize) -> Harness {
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, started) = mpsc::unbounded_channel();
        let executed = Arc::new(Mutex::new(Vec::new()));
        let handler = TestHandler {
            gate: Arc::clone(&gate),
            started: started_tx,
            executed: Arc::clone(&executed),
        };
        let config = PoolConfig {
            workers,
            queue_capacity,
            sync_timeout: Duration::from_secs(5),
        };
        let pool = Arc::new(WorkerPool::new(
            "test",
            handler,
            config,
            PoolConfig::ingest_defaults(),
        ));
        Harness { pool, gate, started, executed }
    }

    fn job(id: u32, action: Action) -> TestJob {
        TestJob { id, action }
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let config = PoolConfig {
            workers: 0,
            queue_capacity: 0,
            sync_timeout: Duration::ZERO,
        }
        .or_defaults(PoolConfig::export_defaults());
        assert_eq!(config.workers, 3);
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.sync_timeout, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let h = harness(1, 4);
        assert_eq!(h.pool.state(), PoolState::Created);
        assert!(matches!(h.pool.submit(job(1, Action::Succeed)).await, Err(PoolError::NotStarted)));
    }

    #[tokio::test]
    async fn submit_sync_delivers_correlated_result() {
        let h = harness(3, 8);
        h.pool.start();
        h.pool.start();
        assert_eq!(h.pool.state(), PoolState::Started);

        let output = h
            .pool
            .submit_sync(job(7, Action::Succeed), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.id, 7);
        assert!(output.success);

        let failed = h
            .pool
            .submit_sync(job(8, Action::Fail), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!failed.success);

        h.pool.stop().await;
        let metrics = h.pool.metrics();
        assert_eq!(metrics.submitted, 2);
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.failed, 1);
    }

    #[tokio::test]
    async fn panicking_job_becomes_failed_result_and_worker_survives() {
        let h = harness(1, 4);
        h.pool.start();

        let output = h
            .pool
            .submit_sync(job(1, Action::Panic), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!output.success);
        assert!(output.error.unwrap().contains("boom 1"));

        // 唯一的 worker 仍然可用
        let output = h
            .pool
            .submit_sync(job(2, Action::Succeed), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(h.pool.metrics().failed, 1);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn full_queue_blocks_submit_instead_of_dropping() {
        let mut h = harness(1, 1);
        h.pool.start();

        h.pool.submit(job(1, Action::Gate)).await.unwrap();
        assert_eq!(h.started.recv().await, Some(1));
        h.pool.submit(job(2, Action::Succeed)).await.unwrap();

        let pool = Arc::clone(&h.pool);
        let blocked = tokio::spawn(async move { pool.submit(job(3, Action::Succeed)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        h.gate.add_permits(1);
        blocked.await.unwrap().unwrap();

        assert_eq!(h.started.recv().await, Some(2));
        assert_eq!(h.started.recv().await, Some(3));
        h.pool.stop().await;
        assert_eq!(*h.executed.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(h.pool.metrics().submitted, 3);
    }

    #[tokio::test]
    async fn stop_abandons_queued_jobs_and_rejects_new_ones() {
        let mut h = harness(1, 8);
        h.pool.start();

        h.pool.submit(job(1, Action::Gate)).await.unwrap();
        assert_eq!(h.started.recv().await, Some(1));
        for id in 2..=4 {
            h.pool.submit(job(id, Action::Succeed)).await.unwrap();
        }

        let pool = Arc::clone(&h.pool);
        let waiter = tokio::spawn(async move {
            pool.submit_sync(job(5, Action::Succeed), Duration::from_secs(5)).await
        });
        while h.pool.metrics().submitted < 5 {
            tokio::task::yield_now().await;
        }

        let pool = Arc::clone(&h.pool);
        let stopping = tokio::spawn(async move { pool.stop().await });
        while h.pool.state() != PoolState::Stopping {
            tokio::task::yield_now().await;
        }

        // 执行中的任务允许完成
        h.gate.add_permits(1);
        stopping.await.unwrap();

        assert_eq!(h.pool.state(), PoolState::Stopped);
        assert_eq!(*h.executed.lock().unwrap(), vec![1]);
        assert_eq!(h.pool.metrics().abandoned, 4);
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Shutdown)));

        assert!(matches!(h.pool.submit(job(6, Action::Succeed)).await, Err(PoolError::Shutdown)));
        assert!(matches!(
            h.pool.submit_sync(job(7, Action::Succeed), Duration::from_secs(1)).await,
            Err(PoolError::Shutdown)
        ));

        // 再次 stop 无效果
        h.pool.stop().await;
        assert_eq!(h.pool.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn submit_sync_times_out_without_cancelling_the_job() {
        let mut h = harness(1, 4);
        h.pool.start();

        let timeout = Duration::from_millis(100);
        let started_at = Instant::now();
        let result = h.pool.submit_sync(job(1, Action::Gate), timeout).await;
        let elapsed = started_at.elapsed();

        assert!(matches!(result, Err(PoolError::DeadlineExceeded(d)) if d == timeout));
        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(h.started.recv().await, Some(1));

        // 调用方已放弃, 任务仍会执行完
        h.gate.add_permits(1);
        let output = h
            .pool
            .submit_sync(job(2, Action::Succeed), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(*h.executed.lock().unwrap(), vec![1, 2]);
        h.pool.stop().await;
    }
}
