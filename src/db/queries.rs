use crate::db::store::{ApplyOutcome, CatalogReader, LedgerStore};
use crate::error::StoreError;
use crate::models::{
    InvoiceLine, InvoiceStatus, MovementFilter, MovementRow, MovementType, NewInvoice,
    ProcessedInvoice, StockFilter, StockRow, ORIGIN_NFE,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

/// Postgres 台账实现
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct InvoiceRecord {
    access_key: String,
    number: Option<String>,
    supplier_name: Option<String>,
    total_items: i32,
    total_value: BigDecimal,
    status: String,
    xml_data: Option<Vec<u8>>,
    processed_at: DateTime<Utc>,
}

impl TryFrom<InvoiceRecord> for ProcessedInvoice {
    type Error = StoreError;

    fn try_from(r: InvoiceRecord) -> Result<Self, Self::Error> {
        Ok(ProcessedInvoice {
            status: r.status.parse::<InvoiceStatus>().map_err(StoreError::Rejected)?,
            access_key: r.access_key,
            number: r.number,
            supplier_name: r.supplier_name,
            total_items: r.total_items,
            total_value: r.total_value,
            raw_xml: r.xml_data.unwrap_or_default(),
            processed_at: r.processed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MovementRecord {
    created_at: DateTime<Utc>,
    product_code: String,
    product_name: Option<String>,
    movement_type: String,
    quantity: BigDecimal,
    origin: Option<String>,
    reference: Option<String>,
    user_email: Option<String>,
    notes: Option<String>,
}

impl TryFrom<MovementRecord> for MovementRow {
    type Error = StoreError;

    fn try_from(r: MovementRecord) -> Result<Self, Self::Error> {
        Ok(MovementRow {
            movement_type: r.movement_type.parse::<MovementType>().map_err(StoreError::Rejected)?,
            created_at: r.created_at,
            product_code: r.product_code,
            product_name: r.product_name,
            quantity: r.quantity,
            origin: r.origin,
            reference: r.reference,
            user_email: r.user_email,
            notes: r.notes,
        })
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    /// 按访问密钥查询发票
    async fn find_invoice(&self, access_key: &str) -> Result<Option<ProcessedInvoice>, StoreError> {
        let record = sqlx::query_as::<_, InvoiceRecord>(
            r#"
            SELECT access_key, number, supplier_name, total_items, total_value,
                   status, xml_data, processed_at
            FROM processed_nfes
            WHERE access_key = $1
            "#,
        )
        .bind(access_key)
        .fetch_optional(&self.pool)
        .await?;

        record.map(ProcessedInvoice::try_from).transpose()
    }

    /// 登记 PENDING 发票, 依赖主键约束去重
    async fn register_pending(&self, invoice: &NewInvoice) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_nfes (
                access_key, number, supplier_name, total_items, total_value,
                status, xml_data, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (access_key) DO NOTHING
            "#,
        )
        .bind(&invoice.access_key)
        .bind(&invoice.number)
        .bind(&invoice.supplier_name)
        .bind(invoice.total_items)
        .bind(&invoice.total_value)
        .bind(InvoiceStatus::Pending.as_str())
        .bind(&invoice.raw_xml)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn apply_entries(
        &self,
        access_key: &str,
        lines: &[InvoiceLine],
        user_id: Option<i32>,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut attempt = 1;
        loop {
            match self.apply_once(access_key, lines, user_id).await {
                Err(e) if attempt < MAX_APPLY_ATTEMPTS && is_lock_conflict(&e) => {
                    tracing::warn!(
                        access_key,
                        attempt,
                        error = %e,
                        "lock conflict, retrying invoice transaction"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// 死锁 / 串行化失败时整笔事务重试的次数上限
const MAX_APPLY_ATTEMPTS: u32 = 3;

/// 40P01 deadlock_detected, 40001 serialization_failure
fn is_lock_conflict(error: &StoreError) -> bool {
    match error {
        StoreError::Database(sqlx::Error::Database(db)) => {
            matches!(db.code().as_deref(), Some("40P01") | Some("40001"))
        }
        _ => false,
    }
}

/// 按商品编码排序: 并发事务以相同顺序获取 products / stocks 行锁
fn in_lock_order(lines: &[InvoiceLine]) -> Vec<&InvoiceLine> {
    let mut ordered: Vec<&InvoiceLine> = lines.iter().collect();
    ordered.sort_by(|a, b| a.code.cmp(&b.code));
    ordered
}

/// LIKE 模式中的 `\`, `%`, `_` 按字面匹配
fn like_pattern(search: &str) -> String {
    let mut pattern = String::with_capacity(search.len() + 2);
    pattern.push('%');
    for c in search.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl PgStore {
    async fn apply_once(
        &self,
        access_key: &str,
        lines: &[InvoiceLine],
        user_id: Option<i32>,
    ) -> Result<ApplyOutcome, StoreError> {
        let start_time = std::time::Instant::now();
        let mut tx = self.pool.begin().await?;

        // 行锁: 同一发票的并发事务在此串行化
        let locked: Option<(String, i32)> = sqlx::query_as(
            r#"
            SELECT status, total_items
            FROM processed_nfes
            WHERE access_key = $1
            FOR UPDATE
            "#,
        )
        .bind(access_key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, total_items)) = locked else {
            return Err(StoreError::InvoiceNotFound(access_key.to_string()));
        };
        if status == InvoiceStatus::Processed.as_str() {
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyProcessed { total_items });
        }

        for line in in_lock_order(lines) {
            sqlx::query(
                r#"
                INSERT INTO products (code, name, unit, cost_price)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (code) DO UPDATE
                SET name = EXCLUDED.name,
                    cost_price = EXCLUDED.cost_price,
                    updated_at = now()
                "#,
            )
            .bind(&line.code)
            .bind(&line.name)
            .bind(&line.unit)
            .bind(&line.unit_cost)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO movements (product_code, type, quantity, origin, reference, user_id)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&line.code)
            .bind(MovementType::Entrada.as_str())
            .bind(&line.quantity)
            .bind(ORIGIN_NFE)
            .bind(access_key)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

            // 累加在数据库侧完成, 并发入库同一商品时由行锁避免丢失更新
            sqlx::query(
                r#"
                INSERT INTO stocks (product_code, quantity)
                VALUES ($1, $2)
                ON CONFLICT (product_code) DO UPDATE
                SET quantity = stocks.quantity + EXCLUDED.quantity,
                    updated_at = now()
                "#,
            )
            .bind(&line.code)
            .bind(&line.quantity)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE processed_nfes
            SET status = $2, processed_at = now()
            WHERE access_key = $1
            "#,
        )
        .bind(access_key)
        .bind(InvoiceStatus::Processed.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(
            access_key,
            items = lines.len(),
            elapsed = ?start_time.elapsed(),
            "invoice transaction committed"
        );

        Ok(ApplyOutcome::Applied { items: lines.len() })
    }
}

#[async_trait]
impl CatalogReader for PgStore {
    /// 库存列表 (仅启用商品, 按名称排序)
    async fn stock_rows(
        &self,
        filter: &StockFilter,
        limit: i64,
    ) -> Result<Vec<StockRow>, StoreError> {
        let search = filter.search.as_deref().map(like_pattern);
        let rows = sqlx::query_as::<_, StockRow>(
            r#"
            SELECT p.code,
                   p.name,
                   COALESCE(s.quantity, 0) AS quantity,
                   p.unit,
                   p.min_stock,
                   p.max_stock,
                   c.name AS category_name,
                   p.cost_price,
                   p.sale_price,
                   p.location
            FROM products p
            LEFT JOIN stocks s ON s.product_code = p.code
            LEFT JOIN categories c ON c.id = p.category_id
            WHERE p.active = TRUE
              AND ($1::text IS NULL OR p.code ILIKE $1 ESCAPE '\' OR p.name ILIKE $1 ESCAPE '\')
              AND ($2::bigint IS NULL OR p.category_id = $2)
            ORDER BY p.name ASC
            LIMIT $3
            "#,
        )
        .bind(search)
        .bind(filter.category_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// 流水列表 (最新在前)
    async fn movement_rows(
        &self,
        filter: &MovementFilter,
        limit: i64,
    ) -> Result<Vec<MovementRow>, StoreError> {
        let records = sqlx::query_as::<_, MovementRecord>(
            r#"
            SELECT m.created_at,
                   m.product_code,
                   p.name AS product_name,
                   m.type AS movement_type,
                   m.quantity,
                   m.origin,
                   m.reference,
                   u.email AS user_email,
                   m.notes
            FROM movements m
            LEFT JOIN products p ON p.code = m.product_code
            LEFT JOIN users u ON u.id = m.user_id
            WHERE ($1::text IS NULL OR m.product_code = $1)
              AND ($2::text IS NULL OR m.type = $2)
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT $3
            "#,
        )
        .bind(&filter.product_code)
        .bind(filter.movement_type.map(|t| t.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(MovementRow::try_from).collect()
    }
}
