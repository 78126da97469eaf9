use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 商品主数据 (products)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Product {
    pub code: String,
    pub name: String,
    pub unit: String,
    pub cost_price: BigDecimal,
    pub sale_price: BigDecimal,
    pub min_stock: BigDecimal,
    pub max_stock: Option<BigDecimal>,
    pub category_id: Option<i64>,
    pub location: Option<String>,
    pub active: bool,
}

impl Product {
    /// 入库时首次出现的商品
    pub fn from_invoice_line(line: &crate::models::InvoiceLine) -> Self {
        Self {
            code: line.code.clone(),
            name: line.name.clone(),
            unit: line.unit.clone(),
            cost_price: line.unit_cost.clone(),
            sale_price: BigDecimal::from(0),
            min_stock: BigDecimal::from(0),
            max_stock: None,
            category_id: None,
            location: None,
            active: true,
        }
    }
}
