//! 内存台账, 语义与 [`PgStore`](crate::db::PgStore) 一致: 单把锁充当事务与行锁,
//! 事务在副本上执行, 失败时丢弃副本.

use crate::db::store::{ApplyOutcome, CatalogReader, LedgerStore};
use crate::error::StoreError;
use crate::models::{
    InvoiceLine, InvoiceStatus, Movement, MovementFilter, MovementRow, MovementType, NewInvoice,
    ProcessedInvoice, Product, StockFilter, StockRow, ORIGIN_NFE,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default, Clone)]
struct Ledger {
    products: HashMap<String, Product>,
    stocks: HashMap<String, BigDecimal>,
    movements: Vec<Movement>,
    next_movement_id: i64,
}

impl Ledger {
    fn append_movement(
        &mut self,
        product_code: &str,
        movement_type: MovementType,
        quantity: BigDecimal,
        origin: Option<String>,
        reference: Option<String>,
        user_id: Option<i32>,
        created_at: DateTime<Utc>,
    ) {
        self.next_movement_id += 1;
        let movement = Movement {
            id: self.next_movement_id,
            product_code: product_code.to_string(),
            movement_type,
            quantity,
            origin,
            reference,
            user_id,
            notes: None,
            created_at,
        };
        let stock = self
            .stocks
            .entry(product_code.to_string())
            .or_insert_with(|| BigDecimal::from(0));
        *stock = &*stock + movement.signed_quantity();
        self.movements.push(movement);
    }
}

#[derive(Debug, Default)]
struct State {
    invoices: HashMap<String, ProcessedInvoice>,
    ledger: Ledger,
    categories: HashMap<i64, String>,
    users: HashMap<i32, String>,
    failing_products: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // 持锁期间不会 panic, 中毒时沿用内部数据
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_category(&self, id: i64, name: &str) {
        self.lock().categories.insert(id, name.to_string());
    }

    pub fn insert_user(&self, id: i32, email: &str) {
        self.lock().users.insert(id, email.to_string());
    }

    pub fn insert_product(&self, product: Product) {
        self.lock().ledger.products.insert(product.code.clone(), product);
    }

    /// 手工流水 (如出库), 同步更新余额
    pub fn record_movement(
        &self,
        product_code: &str,
        movement_type: MovementType,
        quantity: BigDecimal,
        created_at: DateTime<Utc>,
    ) {
        self.lock().ledger.append_movement(
            product_code,
            movement_type,
            quantity,
            Some("MANUAL".to_string()),
            None,
            None,
            created_at,
        );
    }

    /// 之后涉及该商品的入库事务都会失败
    pub fn fail_on_product(&self, code: &str) {
        self.lock().failing_products.insert(code.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_products.clear();
    }

    pub fn stock_of(&self, code: &str) -> Option<BigDecimal> {
        self.lock().ledger.stocks.get(code).cloned()
    }

    pub fn product(&self, code: &str) -> Option<Product> {
        self.lock().ledger.products.get(code).cloned()
    }

    pub fn movements_for(&self, code: &str) -> Vec<Movement> {
        self.lock()
            .ledger
            .movements
            .iter()
            .filter(|m| m.product_code == code)
            .cloned()
            .collect()
    }

    pub fn invoice(&self, access_key: &str) -> Option<ProcessedInvoice> {
        self.lock().invoices.get(access_key).cloned()
    }

    pub fn invoice_count(&self) -> usize {
        self.lock().invoices.len()
    }

    pub fn movement_count(&self) -> usize {
        self.lock().ledger.movements.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_invoice(&self, access_key: &str) -> Result<Option<ProcessedInvoice>, StoreError> {
        Ok(self.lock().invoices.get(access_key).cloned())
    }

    async fn register_pending(&self, invoice: &NewInvoice) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.invoices.contains_key(&invoice.access_key) {
            return Ok(false);
        }
        state.invoices.insert(
            invoice.access_key.clone(),
            ProcessedInvoice {
                access_key: invoice.access_key.clone(),
                number: invoice.number.clone(),
                supplier_name: invoice.supplier_name.clone(),
                total_items: invoice.total_items,
                total_value: invoice.total_value.clone(),
                status: InvoiceStatus::Pending,
                raw_xml: invoice.raw_xml.clone(),
                processed_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn apply_entries(
        &self,
        access_key: &str,
        lines: &[InvoiceLine],
        user_id: Option<i32>,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut state = self.lock();

        let invoice = state
            .invoices
            .get(access_key)
            .ok_or_else(|| StoreError::InvoiceNotFound(access_key.to_string()))?;
        if invoice.status == InvoiceStatus::Processed {
            return Ok(ApplyOutcome::AlreadyProcessed { total_items: invoice.total_items });
        }

        let mut working = state.ledger.clone();
        let now = Utc::now();
        for line in lines {
            if state.failing_products.contains(&line.code) {
                return Err(StoreError::Rejected(format!("product {} write failed", line.code)));
            }

            working
                .products
                .entry(line.code.clone())
                .and_modify(|p| {
                    p.name = line.name.clone();
                    p.cost_price = line.unit_cost.clone();
                })
                .or_insert_with(|| Product::from_invoice_line(line));

            working.append_movement(
                &line.code,
                MovementType::Entrada,
                line.quantity.clone(),
                Some(ORIGIN_NFE.to_string()),
                Some(access_key.to_string()),
                user_id,
                now,
            );
        }

        state.ledger = working;
        if let Some(invoice) = state.invoices.get_mut(access_key) {
            invoice.status = InvoiceStatus::Processed;
            invoice.processed_at = now;
        }

        Ok(ApplyOutcome::Applied { items: lines.len() })
    }
}

#[async_trait]
impl CatalogReader for MemoryStore {
    async fn stock_rows(
        &self,
        filter: &StockFilter,
        limit: i64,
    ) -> Result<Vec<StockRow>, StoreError> {
        let state = self.lock();
        let search = filter.search.as_ref().map(|s| s.to_lowercase());

        let mut products: Vec<&Product> = state
            .ledger
            .products
            .values()
            .filter(|p| p.active)
            .filter(|p| match &search {
                Some(s) => p.code.to_lowercase().contains(s) || p.name.to_lowercase().contains(s),
                None => true,
            })
            .filter(|p| filter.category_id.map_or(true, |id| p.category_id == Some(id)))
            .collect();
        products.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(products
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|p| StockRow {
                code: p.code.clone(),
                name: p.name.clone(),
                quantity: state
                    .ledger
                    .stocks
                    .get(&p.code)
                    .cloned()
                    .unwrap_or_else(|| BigDecimal::from(0)),
                unit: p.unit.clone(),
                min_stock: p.min_stock.clone(),
                max_stock: p.max_stock.clone(),
                category_name: p.category_id.and_then(|id| state.categories.get(&id).cloned()),
                cost_price: p.cost_price.clone(),
                sale_price: p.sale_price.clone(),
                location: p.location.clone(),
            })
            .collect())
    }

    async fn movement_rows(
        &self,
        filter: &MovementFilter,
        limit: i64,
    ) -> Result<Vec<MovementRow>, StoreError> {
        let state = self.lock();

        let mut movements: Vec<&Movement> = state
            .ledger
            .movements
            .iter()
            .filter(|m| filter.product_code.as_ref().map_or(true, |c| &m.product_code == c))
            .filter(|m| filter.movement_type.map_or(true, |t| m.movement_type == t))
            .collect();
        movements.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(movements
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|m| MovementRow {
                created_at: m.created_at,
                product_code: m.product_code.clone(),
                product_name: state.ledger.products.get(&m.product_code).map(|p| p.name.clone()),
                movement_type: m.movement_type,
                quantity: m.quantity.clone(),
                origin: m.origin.clone(),
                reference: m.reference.clone(),
                user_email: m.user_id.and_then(|id| state.users.get(&id).cloned()),
                notes: m.notes.clone(),
            })
            .collect())
    }
}
