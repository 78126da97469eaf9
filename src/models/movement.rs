use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ORIGIN_NFE: &str = "NFE";

/// 流水方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementType {
    Entrada,
    Saida,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Entrada => "ENTRADA",
            MovementType::Saida => "SAIDA",
        }
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENTRADA" => Ok(MovementType::Entrada),
            "SAIDA" => Ok(MovementType::Saida),
            other => Err(format!("unknown movement type: {}", other)),
        }
    }
}

/// 库存流水 (movements), 只追加不修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movement {
    pub id: i64,
    pub product_code: String,
    pub movement_type: MovementType,
    pub quantity: BigDecimal,
    pub origin: Option<String>,
    pub reference: Option<String>,
    pub user_id: Option<i32>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Movement {
    /// 带符号数量: 入库为正, 出库为负
    pub fn signed_quantity(&self) -> BigDecimal {
        match self.movement_type {
            MovementType::Entrada => self.quantity.clone(),
            MovementType::Saida => -self.quantity.clone(),
        }
    }
}
