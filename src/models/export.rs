use crate::error::ExportError;
use crate::models::MovementType;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// 导出类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Stock,
    Movements,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::Stock => "stock",
            ExportKind::Movements => "movements",
        }
    }
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportKind {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stock" => Ok(ExportKind::Stock),
            "movements" => Ok(ExportKind::Movements),
            other => Err(ExportError::UnknownKind(other.to_string())),
        }
    }
}

/// 过滤条件中的非空值
fn filter_value<'a>(filters: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    filters.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// 库存导出过滤条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StockFilter {
    pub search: Option<String>,
    pub category_id: Option<i64>,
}

impl StockFilter {
    pub fn from_map(filters: &HashMap<String, String>) -> Result<Self, ExportError> {
        let category_id = match filter_value(filters, "category_id") {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| ExportError::InvalidFilter {
                key: "category_id".to_string(),
                value: raw.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            search: filter_value(filters, "search").map(str::to_string),
            category_id,
        })
    }
}

/// 流水导出过滤条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovementFilter {
    pub product_code: Option<String>,
    pub movement_type: Option<MovementType>,
}

impl MovementFilter {
    pub fn from_map(filters: &HashMap<String, String>) -> Result<Self, ExportError> {
        let movement_type = match filter_value(filters, "type") {
            Some(raw) => Some(raw.parse::<MovementType>().map_err(|_| ExportError::InvalidFilter {
                key: "type".to_string(),
                value: raw.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            product_code: filter_value(filters, "product_code").map(str::to_string),
            movement_type,
        })
    }
}

/// 库存导出行 (商品 + 余额 + 分类)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StockRow {
    pub code: String,
    pub name: String,
    pub quantity: BigDecimal,
    pub unit: String,
    pub min_stock: BigDecimal,
    pub max_stock: Option<BigDecimal>,
    pub category_name: Option<String>,
    pub cost_price: BigDecimal,
    pub sale_price: BigDecimal,
    pub location: Option<String>,
}

/// 库存状态列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockStatus {
    InStock,
    LowStock,
    OutOfStock,
}

impl StockStatus {
    pub fn of(quantity: &BigDecimal, min_stock: &BigDecimal) -> Self {
        if *quantity <= BigDecimal::from(0) {
            StockStatus::OutOfStock
        } else if quantity < min_stock {
            StockStatus::LowStock
        } else {
            StockStatus::InStock
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StockStatus::InStock => "in stock",
            StockStatus::LowStock => "low stock",
            StockStatus::OutOfStock => "out of stock",
        }
    }
}

impl StockRow {
    pub fn status(&self) -> StockStatus {
        StockStatus::of(&self.quantity, &self.min_stock)
    }
}

/// 流水导出行 (流水 + 商品名 + 用户)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementRow {
    pub created_at: DateTime<Utc>,
    pub product_code: String,
    pub product_name: Option<String>,
    pub movement_type: MovementType,
    pub quantity: BigDecimal,
    pub origin: Option<String>,
    pub reference: Option<String>,
    pub user_email: Option<String>,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn stock_status_thresholds() {
        let q = |v: i32| BigDecimal::from(v);
        assert_eq!(StockStatus::of(&q(0), &q(5)), StockStatus::OutOfStock);
        assert_eq!(StockStatus::of(&q(-2), &q(0)), StockStatus::OutOfStock);
        assert_eq!(StockStatus::of(&q(3), &q(5)), StockStatus::LowStock);
        assert_eq!(StockStatus::of(&q(5), &q(5)), StockStatus::InStock);
        assert_eq!(StockStatus::OutOfStock.label(), "out of stock");
    }

    #[test]
    fn stock_filter_parses_category() {
        let filter = StockFilter::from_map(&map(&[("category_id", "5"), ("search", " ")])).unwrap();
        assert_eq!(filter.category_id, Some(5));
        assert_eq!(filter.search, None);

        let err = StockFilter::from_map(&map(&[("category_id", "abc")])).unwrap_err();
        assert!(matches!(err, ExportError::InvalidFilter { key, .. } if key == "category_id"));
    }

    #[test]
    fn movement_filter_parses_type() {
        let filter =
            MovementFilter::from_map(&map(&[("type", "entrada"), ("product_code", "P1")])).unwrap();
        assert_eq!(filter.movement_type, Some(MovementType::Entrada));
        assert_eq!(filter.product_code.as_deref(), Some("P1"));

        assert!(MovementFilter::from_map(&map(&[("type", "TRANSFER")])).is_err());
    }

    #[test]
    fn export_kind_from_str() {
        assert_eq!("stock".parse::<ExportKind>().unwrap(), ExportKind::Stock);
        assert_eq!("movements".parse::<ExportKind>().unwrap(), ExportKind::Movements);
        assert!(matches!("pdf".parse::<ExportKind>(), Err(ExportError::UnknownKind(_))));
    }
}
