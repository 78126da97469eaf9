use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// 工作池错误 (与业务状态无关)
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool has not been started")]
    NotStarted,

    #[error("worker pool is shutting down")]
    Shutdown,

    #[error("no result within {0:?}")]
    DeadlineExceeded(Duration),
}

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invoice {0} not found")]
    InvoiceNotFound(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// 入库处理错误
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid invoice XML: {0}")]
    Parse(String),

    #[error("invoice {0} not found")]
    NotFound(String),

    #[error("lookup failed for invoice {key}: {source}")]
    Lookup {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("transaction failed for invoice {key}: {source}")]
    Transaction {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl LedgerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LedgerError::Parse(_) => FailureKind::Parse,
            LedgerError::NotFound(_) => FailureKind::NotFound,
            LedgerError::Lookup { .. } | LedgerError::Transaction { .. } => {
                FailureKind::Transaction
            }
        }
    }

    /// 已解析出的发票访问密钥 (解析失败时没有)
    pub fn invoice_key(&self) -> Option<&str> {
        match self {
            LedgerError::Parse(_) => None,
            LedgerError::NotFound(key)
            | LedgerError::Lookup { key, .. }
            | LedgerError::Transaction { key, .. } => Some(key),
        }
    }
}

/// 导出处理错误
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid filter {key}={value}")]
    InvalidFilter { key: String, value: String },

    #[error("unknown export kind: {0}")]
    UnknownKind(String),

    #[error("export query failed: {0}")]
    Query(#[source] StoreError),

    #[error("export file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv write error: {0}")]
    Csv(#[from] csv::Error),

    #[error("export writer task failed: {0}")]
    Worker(String),
}

impl ExportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExportError::InvalidFilter { .. } | ExportError::UnknownKind(_) => FailureKind::Parse,
            ExportError::Query(_) => FailureKind::Query,
            ExportError::Io(_) | ExportError::Csv(_) | ExportError::Worker(_) => FailureKind::Io,
        }
    }
}

/// 结果中携带的失败类别, 供调用层映射响应码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    NotFound,
    Transaction,
    Query,
    Io,
    Panic,
}
