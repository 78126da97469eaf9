use crate::error::{ExportError, FailureKind, LedgerError};
use crate::models::ExportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// 工作池执行结果的公共约定
pub trait JobResult: Send + 'static {
    fn is_success(&self) -> bool;

    /// 业务处理 panic 时由工作池构造的失败结果
    fn from_panic(message: String) -> Self;

    fn set_duration(&mut self, duration: Duration);
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// NF-e 入库任务
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub xml_bytes: Vec<u8>,
    pub submitter_id: Option<i32>,
    pub submitter_label: String,
}

impl IngestJob {
    pub fn new(xml_bytes: Vec<u8>, submitter_label: impl Into<String>) -> Self {
        Self {
            xml_bytes,
            submitter_id: None,
            submitter_label: submitter_label.into(),
        }
    }

    pub fn with_submitter_id(mut self, submitter_id: i32) -> Self {
        self.submitter_id = Some(submitter_id);
        self
    }
}

/// NF-e 入库结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestResult {
    pub success: bool,
    pub item_count: usize,
    pub invoice_key: String,
    /// 发票此前已处理, 本次为幂等返回
    pub duplicate: bool,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub duration_ms: u64,
}

impl IngestResult {
    pub fn processed(invoice_key: impl Into<String>, item_count: usize, duplicate: bool) -> Self {
        Self {
            success: true,
            item_count,
            invoice_key: invoice_key.into(),
            duplicate,
            ..Self::default()
        }
    }

    pub fn failed(error: &LedgerError) -> Self {
        Self {
            success: false,
            invoice_key: error.invoice_key().unwrap_or_default().to_string(),
            error: Some(error.to_string()),
            failure: Some(error.kind()),
            ..Self::default()
        }
    }
}

impl JobResult for IngestResult {
    fn is_success(&self) -> bool {
        self.success
    }

    fn from_panic(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
            failure: Some(FailureKind::Panic),
            ..Self::default()
        }
    }

    fn set_duration(&mut self, duration: Duration) {
        self.duration_ms = duration_ms(duration);
    }
}

/// CSV 导出任务
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub kind: ExportKind,
    pub filters: HashMap<String, String>,
    pub submitter_id: Option<i32>,
    pub submitter_label: String,
}

impl ExportJob {
    pub fn new(
        kind: ExportKind,
        filters: HashMap<String, String>,
        submitter_label: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            filters,
            submitter_id: None,
            submitter_label: submitter_label.into(),
        }
    }
}

/// CSV 导出结果, 文件由调用方负责删除
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportResult {
    pub success: bool,
    pub file_path: String,
    pub file_name: String,
    pub row_count: usize,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub duration_ms: u64,
}

impl ExportResult {
    pub fn written(file_path: &Path, file_name: String, row_count: usize) -> Self {
        Self {
            success: true,
            file_path: file_path.to_string_lossy().into_owned(),
            file_name,
            row_count,
            ..Self::default()
        }
    }

    pub fn failed(error: &ExportError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            failure: Some(error.kind()),
            ..Self::default()
        }
    }
}

impl JobResult for ExportResult {
    fn is_success(&self) -> bool {
        self.success
    }

    fn from_panic(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
            failure: Some(FailureKind::Panic),
            ..Self::default()
        }
    }

    fn set_duration(&mut self, duration: Duration) {
        self.duration_ms = duration_ms(duration);
    }
}
