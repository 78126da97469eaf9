use crate::db::CatalogReader;
use crate::error::ExportError;
use crate::models::{ExportKind, MovementFilter, MovementRow, StockFilter, StockRow};
use crate::worker::{ExportJob, ExportResult, JobHandler};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

pub const DEFAULT_ROW_LIMIT: i64 = 100_000;

const STOCK_HEADER: [&str; 11] = [
    "Code", "Name", "Quantity", "Unit", "MinStock", "MaxStock", "Category",
    "CostPrice", "SalePrice", "Location", "Status",
];

const MOVEMENT_HEADER: [&str; 9] = [
    "Date", "ProductCode", "ProductName", "Type", "Quantity", "Origin", "Reference", "User",
    "Notes",
];

const UNCATEGORIZED: &str = "Uncategorized";

/// 已生成的导出文件
#[derive(Debug, Clone)]
pub struct ExportFile {
    pub path: PathBuf,
    pub file_name: String,
    pub row_count: usize,
}

/// CSV 导出处理器
pub struct ExportProcessor {
    catalog: Arc<dyn CatalogReader>,
    export_dir: PathBuf,
    row_limit: i64,
}

impl ExportProcessor {
    pub fn new(
        catalog: Arc<dyn CatalogReader>,
        export_dir: impl Into<PathBuf>,
        row_limit: i64,
    ) -> Self {
        Self {
            catalog,
            export_dir: export_dir.into(),
            row_limit: if row_limit > 0 { row_limit } else { DEFAULT_ROW_LIMIT },
        }
    }

    pub async fn export(
        &self,
        kind: ExportKind,
        filters: &HashMap<String, String>,
    ) -> Result<ExportFile, ExportError> {
        match kind {
            ExportKind::Stock => self.export_stock(filters).await,
            ExportKind::Movements => self.export_movements(filters).await,
        }
    }

    /// 库存快照
    async fn export_stock(
        &self,
        filters: &HashMap<String, String>,
    ) -> Result<ExportFile, ExportError> {
        let filter = StockFilter::from_map(filters)?;
        let rows = self
            .catalog
            .stock_rows(&filter, self.row_limit)
            .await
            .map_err(ExportError::Query)?;

        self.write(ExportKind::Stock, &STOCK_HEADER, rows, stock_record).await
    }

    /// 库存流水 (最新在前)
    async fn export_movements(
        &self,
        filters: &HashMap<String, String>,
    ) -> Result<ExportFile, ExportError> {
        let filter = MovementFilter::from_map(filters)?;
        let rows = self
            .catalog
            .movement_rows(&filter, self.row_limit)
            .await
            .map_err(ExportError::Query)?;

        self.write(ExportKind::Movements, &MOVEMENT_HEADER, rows, movement_record).await
    }

    /// 在阻塞线程上写 CSV
    async fn write<T: Send + 'static>(
        &self,
        kind: ExportKind,
        header: &'static [&'static str],
        rows: Vec<T>,
        to_record: fn(&T) -> Vec<String>,
    ) -> Result<ExportFile, ExportError> {
        tokio::fs::create_dir_all(&self.export_dir).await?;
        let dir = self.export_dir.clone();

        tokio::task::spawn_blocking(move || -> Result<ExportFile, ExportError> {
            let (path, file_name, file) = create_export_file(&dir, kind.as_str(), Local::now())?;
            let mut writer = csv::Writer::from_writer(file);

            writer.write_record(header)?;
            for row in &rows {
                writer.write_record(to_record(row))?;
            }
            writer.flush()?;

            Ok(ExportFile { path, file_name, row_count: rows.len() })
        })
        .await
        .map_err(|e| ExportError::Worker(e.to_string()))?
    }
}

/// `<prefix>_<YYYYMMDD_HHMMSS>_<纳秒>.csv`, 以 create_new 打开避免并发导出互相覆盖
fn create_export_file(
    dir: &Path,
    prefix: &str,
    now: DateTime<Local>,
) -> Result<(PathBuf, String, File), ExportError> {
    let stamp = now.format("%Y%m%d_%H%M%S");
    let mut suffix = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);

    loop {
        let file_name = format!("{}_{}_{}.csv", prefix, stamp, suffix);
        let path = dir.join(&file_name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file_name, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// 两位小数
fn decimal_2(value: &BigDecimal) -> String {
    value.round(2).with_scale(2).to_string()
}

fn stock_record(row: &StockRow) -> Vec<String> {
    vec![
        row.code.clone(),
        row.name.clone(),
        decimal_2(&row.quantity),
        row.unit.clone(),
        decimal_2(&row.min_stock),
        row.max_stock.as_ref().map(decimal_2).unwrap_or_default(),
        row.category_name.clone().unwrap_or_else(|| UNCATEGORIZED.to_string()),
        decimal_2(&row.cost_price),
        decimal_2(&row.sale_price),
        row.location.clone().unwrap_or_default(),
        row.status().label().to_string(),
    ]
}

fn movement_record(row: &MovementRow) -> Vec<String> {
    vec![
        row.created_at.with_timezone(&Local).format("%d/%m/%Y %H:%M:%S").to_string(),
        row.product_code.clone(),
        row.product_name.clone().unwrap_or_default(),
        row.movement_type.as_str().to_string(),
        decimal_2(&row.quantity),
        row.origin.clone().unwrap_or_default(),
        row.reference.clone().unwrap_or_default(),
        row.user_email.clone().unwrap_or_default(),
        row.notes.clone().unwrap_or_default(),
    ]
}

/// 删除导出目录中超过 max_age 的 CSV (调用方未清理 / 写入中途失败遗留的文件)
pub fn sweep_stale_exports(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("csv") {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= max_age {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to remove stale export")
                }
            }
        }
    }
    Ok(removed)
}

#[async_trait]
impl JobHandler for ExportProcessor {
    type Job = ExportJob;
    type Output = ExportResult;

    async fn handle(&self, job: ExportJob, worker_id: usize) -> ExportResult {
        info!(
            worker_id,
            kind = %job.kind,
            submitter = %job.submitter_label,
            "Processing export"
        );

        match self.export(job.kind, &job.filters).await {
            Ok(file) => {
                info!(
                    worker_id,
                    kind = %job.kind,
                    file = %file.path.display(),
                    rows = file.row_count,
                    "Export completed"
                );
                ExportResult::written(&file.path, file.file_name, file.row_count)
            }
            Err(e) => {
                error!(worker_id, kind = %job.kind, error = %e, "Export failed");
                ExportResult::failed(&e)
            }
        }
    }
}
