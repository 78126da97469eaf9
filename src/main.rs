use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stock_ledger_rust::api::{self, AppState};
use stock_ledger_rust::service::{sweep_stale_exports, LogNotifier};
use stock_ledger_rust::worker::{export_pool, ingest_pool};
use stock_ledger_rust::{
    create_pool, ensure_schema, AppConfig, ExportProcessor, LedgerProcessor, PgStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 使用本地时间格式, 级别取自 RUST_LOG
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::from_env()?;
    info!("Starting server with config: {:?}", config);

    // 创建数据库连接池 (两个工作池共享)
    let pool = create_pool(&config.database.url, config.database.max_connections).await?;
    ensure_schema(&pool).await?;
    info!("Database pool created");

    let store = Arc::new(PgStore::new(pool));
    let ledger = LedgerProcessor::new(store.clone(), Arc::new(LogNotifier));
    let exporter = ExportProcessor::new(store, config.export.dir.clone(), config.export.row_limit);

    let ingest = Arc::new(ingest_pool(ledger, config.ingest_pool_config()));
    let export = Arc::new(export_pool(exporter, config.export_pool_config()));
    ingest.start();
    export.start();

    // 定时清理过期导出文件
    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweep_exports(
        config.export.dir.clone(),
        config.export_max_age(),
        config.export_sweep_interval(),
        shutdown.clone(),
    ));

    let state = AppState {
        ingest: Arc::clone(&ingest),
        export: Arc::clone(&export),
    };

    let app = api::router(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/nfes/upload                - ingest NF-e XML");
    info!("  POST /api/nfes/:access_key/process   - retry pending invoice");
    info!("  POST /api/exports/:kind              - stock | movements CSV");
    info!("  GET  /api/pools/metrics              - worker pool counters");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // 先停工作池, 等待执行中的任务结束
    info!("Shutting down");
    shutdown.cancel();
    ingest.stop().await;
    export.stop().await;
    if let Err(e) = sweeper.await {
        warn!(error = %e, "export sweeper terminated abnormally");
    }

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn sweep_exports(
    dir: PathBuf,
    max_age: Duration,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let target = dir.clone();
        match tokio::task::spawn_blocking(move || sweep_stale_exports(&target, max_age)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => info!(removed, dir = %dir.display(), "Removed stale exports"),
            Ok(Err(e)) => warn!(error = %e, dir = %dir.display(), "export sweep failed"),
            Err(e) => warn!(error = %e, "export sweep task failed"),
        }
    }
}
