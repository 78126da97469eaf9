use crate::error::StoreError;
use crate::models::{
    InvoiceLine, MovementFilter, MovementRow, NewInvoice, ProcessedInvoice, StockFilter, StockRow,
};
use async_trait::async_trait;

/// 入库事务结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 本次事务写入了全部明细
    Applied { items: usize },
    /// 发票已由其他提交处理完毕
    AlreadyProcessed { total_items: i32 },
}

/// 台账写入接口 (发票登记 + 入库事务)
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_invoice(&self, access_key: &str) -> Result<Option<ProcessedInvoice>, StoreError>;

    /// 以 PENDING 状态登记发票; 唯一键冲突时返回 false
    async fn register_pending(&self, invoice: &NewInvoice) -> Result<bool, StoreError>;

    /// 单事务: 锁定发票行, 逐行 upsert 商品 / 追加流水 / 累加库存, 最后置为 PROCESSED.
    /// 任一步失败整体回滚, 发票保持 PENDING
    async fn apply_entries(
        &self,
        access_key: &str,
        lines: &[InvoiceLine],
        user_id: Option<i32>,
    ) -> Result<ApplyOutcome, StoreError>;
}

/// 导出查询接口
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn stock_rows(
        &self,
        filter: &StockFilter,
        limit: i64,
    ) -> Result<Vec<StockRow>, StoreError>;

    async fn movement_rows(
        &self,
        filter: &MovementFilter,
        limit: i64,
    ) -> Result<Vec<MovementRow>, StoreError>;
}
