pub mod job;
pub mod metrics;
pub mod pool;

pub use job::{ExportJob, ExportResult, IngestJob, IngestResult, JobResult};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use pool::{JobHandler, PoolConfig, PoolState, WorkerPool};

use crate::service::{ExportProcessor, LedgerProcessor};

/// NF-e 入库工作池
pub type IngestPool = WorkerPool<LedgerProcessor>;

/// CSV 导出工作池
pub type ExportPool = WorkerPool<ExportProcessor>;

pub fn ingest_pool(processor: LedgerProcessor, config: PoolConfig) -> IngestPool {
    WorkerPool::new("nfe", processor, config, PoolConfig::ingest_defaults())
}

pub fn export_pool(processor: ExportProcessor, config: PoolConfig) -> ExportPool {
    WorkerPool::new("export", processor, config, PoolConfig::export_defaults())
}
