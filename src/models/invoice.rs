use crate::error::LedgerError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 发票处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvoiceStatus {
    Pending,
    Processed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(InvoiceStatus::Pending),
            "PROCESSED" => Ok(InvoiceStatus::Processed),
            other => Err(format!("unknown invoice status: {}", other)),
        }
    }
}

/// 已登记发票 (processed_nfes), 幂等边界
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedInvoice {
    pub access_key: String,
    pub number: Option<String>,
    pub supplier_name: Option<String>,
    pub total_items: i32,
    pub total_value: BigDecimal,
    pub status: InvoiceStatus,
    #[serde(skip)]
    pub raw_xml: Vec<u8>,
    pub processed_at: DateTime<Utc>,
}

/// 待登记发票
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub access_key: String,
    pub number: Option<String>,
    pub supplier_name: Option<String>,
    pub total_items: i32,
    pub total_value: BigDecimal,
    pub raw_xml: Vec<u8>,
}

/// 入库明细行 (一行 = 一条 ENTRADA 流水)
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceLine {
    pub code: String,
    pub name: String,
    pub unit: String,
    pub quantity: BigDecimal,
    pub unit_cost: BigDecimal,
}

/// 解析后的 NF-e
#[derive(Debug, Clone)]
pub struct InvoiceDocument {
    pub access_key: String,
    pub number: Option<String>,
    pub supplier_name: Option<String>,
    pub total_value: BigDecimal,
    pub lines: Vec<InvoiceLine>,
}

pub const DEFAULT_UNIT: &str = "UN";

// ---- XML 映射 (nfeProc/NFe/infNFe) ----

#[derive(Debug, Deserialize)]
struct NfeProcXml {
    #[serde(rename = "NFe")]
    nfe: NfeXml,
}

#[derive(Debug, Deserialize)]
struct NfeXml {
    #[serde(rename = "infNFe")]
    inf: InfNfeXml,
}

#[derive(Debug, Deserialize)]
struct InfNfeXml {
    #[serde(rename = "@Id", default)]
    id: String,
    #[serde(default)]
    ide: Option<IdeXml>,
    #[serde(default)]
    emit: Option<EmitXml>,
    #[serde(rename = "det", default)]
    det: Vec<DetXml>,
    #[serde(default)]
    total: Option<TotalXml>,
}

#[derive(Debug, Deserialize)]
struct IdeXml {
    #[serde(rename = "nNF", default)]
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmitXml {
    #[serde(rename = "xNome", default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetXml {
    prod: ProdXml,
}

#[derive(Debug, Deserialize)]
struct ProdXml {
    #[serde(rename = "cProd", default)]
    code: String,
    #[serde(rename = "xProd", default)]
    name: String,
    #[serde(rename = "qCom", default)]
    quantity: String,
    #[serde(rename = "uCom", default)]
    unit: Option<String>,
    #[serde(rename = "vUnCom", default)]
    unit_cost: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TotalXml {
    #[serde(rename = "ICMSTot", default)]
    icms: Option<IcmsTotXml>,
}

#[derive(Debug, Deserialize)]
struct IcmsTotXml {
    #[serde(rename = "vNF", default)]
    value: Option<String>,
}

fn parse_decimal(field: &str, raw: &str) -> Result<BigDecimal, LedgerError> {
    BigDecimal::from_str(raw.trim())
        .map_err(|e| LedgerError::Parse(format!("{} '{}': {}", field, raw, e)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl InvoiceDocument {
    /// 解析 NF-e XML, 接受 <nfeProc> 包装或裸 <NFe>
    pub fn parse(xml: &[u8]) -> Result<Self, LedgerError> {
        let text = std::str::from_utf8(xml)
            .map_err(|e| LedgerError::Parse(format!("not UTF-8: {}", e)))?;
        let text = text.trim_start_matches('\u{feff}');

        let inf = match quick_xml::de::from_str::<NfeProcXml>(text) {
            Ok(proc) => proc.nfe.inf,
            Err(proc_err) => match quick_xml::de::from_str::<NfeXml>(text) {
                Ok(nfe) => nfe.inf,
                Err(_) => return Err(LedgerError::Parse(proc_err.to_string())),
            },
        };

        let access_key = inf.id.trim().to_string();
        if access_key.is_empty() {
            return Err(LedgerError::Parse("missing infNFe Id (access key)".to_string()));
        }

        let mut lines = Vec::with_capacity(inf.det.len());
        for (idx, det) in inf.det.into_iter().enumerate() {
            let prod = det.prod;
            let code = prod.code.trim().to_string();
            if code.is_empty() {
                return Err(LedgerError::Parse(format!("item {} has no cProd", idx + 1)));
            }
            let quantity = parse_decimal("qCom", &prod.quantity)?;
            if quantity <= BigDecimal::from(0) {
                return Err(LedgerError::Parse(format!(
                    "item {} ({}) has non-positive quantity {}",
                    idx + 1,
                    code,
                    quantity
                )));
            }
            let unit_cost = match prod.unit_cost {
                Some(raw) => parse_decimal("vUnCom", &raw)?,
                None => BigDecimal::from(0),
            };
            lines.push(InvoiceLine {
                code,
                name: prod.name.trim().to_string(),
                unit: non_empty(prod.unit).unwrap_or_else(|| DEFAULT_UNIT.to_string()),
                quantity,
                unit_cost,
            });
        }

        let total_value = match inf.total.and_then(|t| t.icms).and_then(|i| i.value) {
            Some(raw) => parse_decimal("vNF", &raw)?,
            None => BigDecimal::from(0),
        };

        Ok(Self {
            access_key,
            number: non_empty(inf.ide.and_then(|i| i.number)),
            supplier_name: non_empty(inf.emit.and_then(|e| e.name)),
            total_value,
            lines,
        })
    }

    pub fn item_count(&self) -> usize {
        self.lines.len()
    }

    pub fn to_new_invoice(&self, raw_xml: &[u8]) -> NewInvoice {
        NewInvoice {
            access_key: self.access_key.clone(),
            number: self.number.clone(),
            supplier_name: self.supplier_name.clone(),
            total_items: self.lines.len() as i32,
            total_value: self.total_value.clone(),
            raw_xml: raw_xml.to_vec(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 测试用 NF-e: (cProd, xProd, qCom, vUnCom)
    pub(crate) fn sample_xml(access_key: &str, items: &[(&str, &str, &str, &str)]) -> Vec<u8> {
        let mut det = String::new();
        for (i, (code, name, qty, cost)) in items.iter().enumerate() {
            det.push_str(&format!(
                r#"<det nItem="{n}"><prod><cProd>{code}</cProd><xProd>{name}</xProd><uCom>UN</uCom><qCom>{qty}</qCom><vUnCom>{cost}</vUnCom></prod></det>"#,
                n = i + 1,
            ));
        }
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><nfeProc xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><NFe><infNFe Id="{access_key}" versao="4.00"><ide><nNF>1234</nNF></ide><emit><xNome>Fornecedor Teste</xNome></emit>{det}<total><ICMSTot><vNF>150.00</vNF></ICMSTot></total></infNFe></NFe></nfeProc>"#
        )
        .into_bytes()
    }

    #[test]
    fn parses_wrapped_invoice() {
        let xml = sample_xml(
            "NFE-001",
            &[("P1", "Parafuso", "10.0000", "1.50"), ("P2", "Porca", "2", "0.25")],
        );
        let doc = InvoiceDocument::parse(&xml).unwrap();

        assert_eq!(doc.access_key, "NFE-001");
        assert_eq!(doc.number.as_deref(), Some("1234"));
        assert_eq!(doc.supplier_name.as_deref(), Some("Fornecedor Teste"));
        assert_eq!(doc.total_value, BigDecimal::from_str("150.00").unwrap());
        assert_eq!(doc.item_count(), 2);
        assert_eq!(doc.lines[0].code, "P1");
        assert_eq!(doc.lines[0].quantity, BigDecimal::from(10));
        assert_eq!(doc.lines[0].unit, "UN");
        assert_eq!(doc.lines[1].unit_cost, BigDecimal::from_str("0.25").unwrap());
    }

    #[test]
    fn parses_bare_nfe_root() {
        let xml = br#"<NFe><infNFe Id="NFe123"><det nItem="1"><prod><cProd>A</cProd><xProd>Item A</xProd><qCom>3</qCom></prod></det></infNFe></NFe>"#;
        let doc = InvoiceDocument::parse(xml).unwrap();

        assert_eq!(doc.access_key, "NFe123");
        assert_eq!(doc.lines.len(), 1);
        assert_eq!(doc.lines[0].unit, DEFAULT_UNIT);
        assert_eq!(doc.lines[0].unit_cost, BigDecimal::from(0));
        assert!(doc.supplier_name.is_none());
    }

    #[test]
    fn rejects_malformed_xml() {
        let err = InvoiceDocument::parse(b"<nfeProc><NFe><infNFe").unwrap_err();
        assert!(matches!(err, LedgerError::Parse(_)));
    }

    #[test]
    fn rejects_missing_access_key() {
        let xml = br#"<nfeProc><NFe><infNFe><det><prod><cProd>A</cProd><qCom>1</qCom></prod></det></infNFe></NFe></nfeProc>"#;
        let err = InvoiceDocument::parse(xml).unwrap_err();
        assert!(matches!(err, LedgerError::Parse(msg) if msg.contains("access key")));
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let xml = sample_xml("NFE-002", &[("P1", "Parafuso", "0", "1.00")]);
        assert!(matches!(InvoiceDocument::parse(&xml), Err(LedgerError::Parse(_))));

        let xml = sample_xml("NFE-003", &[("P1", "Parafuso", "abc", "1.00")]);
        assert!(matches!(InvoiceDocument::parse(&xml), Err(LedgerError::Parse(_))));
    }
}
