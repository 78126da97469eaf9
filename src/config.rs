use crate::worker::PoolConfig;
use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub workers: WorkersConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// 两个工作池的规模与同步等待时长
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub nfe_workers: usize,
    pub nfe_queue_capacity: usize,
    pub nfe_timeout_secs: u64,
    pub export_workers: usize,
    pub export_queue_capacity: usize,
    pub export_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub dir: PathBuf,
    pub row_limit: i64,
    /// 超过该时长的导出文件由定时清理删除
    pub max_age_secs: u64,
    pub sweep_interval_secs: u64,
}

/// 环境变量的扁平映射 (SERVER_HOST -> server_host)
#[derive(Debug, Deserialize)]
struct EnvSettings {
    server_host: String,
    server_port: u16,
    database_url: String,
    db_max_connections: u32,
    nfe_workers: usize,
    nfe_queue_capacity: usize,
    nfe_timeout_secs: u64,
    export_workers: usize,
    export_queue_capacity: usize,
    export_timeout_secs: u64,
    export_dir: PathBuf,
    export_row_limit: i64,
    export_max_age_secs: u64,
    export_sweep_interval_secs: u64,
}

impl From<EnvSettings> for AppConfig {
    fn from(s: EnvSettings) -> Self {
        Self {
            server: ServerConfig {
                host: s.server_host,
                port: s.server_port,
            },
            database: DatabaseConfig {
                url: s.database_url,
                max_connections: s.db_max_connections,
            },
            workers: WorkersConfig {
                nfe_workers: s.nfe_workers,
                nfe_queue_capacity: s.nfe_queue_capacity,
                nfe_timeout_secs: s.nfe_timeout_secs,
                export_workers: s.export_workers,
                export_queue_capacity: s.export_queue_capacity,
                export_timeout_secs: s.export_timeout_secs,
            },
            export: ExportConfig {
                dir: s.export_dir,
                row_limit: s.export_row_limit,
                max_age_secs: s.export_max_age_secs,
                sweep_interval_secs: s.export_sweep_interval_secs,
            },
        }
    }
}

impl AppConfig {
    /// 从环境变量加载配置, 未设置的项取默认值
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(Environment::default().try_parsing(true))
    }

    fn from_source(env: Environment) -> Result<Self, ConfigError> {
        let settings: EnvSettings = Config::builder()
            .set_default("server_host", "127.0.0.1")?
            .set_default("server_port", 8080)?
            .set_default("database_url", "postgres://localhost/stock_ledger")?
            .set_default("db_max_connections", 20)?
            .set_default("nfe_workers", 5)?
            .set_default("nfe_queue_capacity", 100)?
            .set_default("nfe_timeout_secs", 300)?
            .set_default("export_workers", 3)?
            .set_default("export_queue_capacity", 50)?
            .set_default("export_timeout_secs", 600)?
            .set_default("export_dir", "./exports")?
            .set_default("export_row_limit", 100_000)?
            .set_default("export_max_age_secs", 86_400)?
            .set_default("export_sweep_interval_secs", 3_600)?
            .add_source(env)
            .build()?
            .try_deserialize()?;
        Ok(settings.into())
    }

    pub fn ingest_pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers.nfe_workers,
            queue_capacity: self.workers.nfe_queue_capacity,
            sync_timeout: Duration::from_secs(self.workers.nfe_timeout_secs),
        }
    }

    pub fn export_pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers.export_workers,
            queue_capacity: self.workers.export_queue_capacity,
            sync_timeout: Duration::from_secs(self.workers.export_timeout_secs),
        }
    }

    pub fn export_max_age(&self) -> Duration {
        Duration::from_secs(self.export.max_age_secs)
    }

    pub fn export_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.export.sweep_interval_secs.max(1))
    }
}
