use crate::db::{ApplyOutcome, LedgerStore};
use crate::error::{LedgerError, StoreError};
use crate::models::{InvoiceDocument, InvoiceStatus, ProcessedInvoice};
use crate::service::notify::{notify_new_invoice, Notifier};
use crate::worker::{IngestJob, IngestResult, JobHandler};
use async_trait::async_trait;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 入库结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub access_key: String,
    pub item_count: usize,
    /// 发票此前已处理完毕, 本次未写入任何数据
    pub duplicate: bool,
}

/// NF-e 入库处理器: 解析 -> 去重 -> 单事务写台账
pub struct LedgerProcessor {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
}

impl LedgerProcessor {
    pub fn new(store: Arc<dyn LedgerStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// 处理一张发票. 同一访问密钥重复提交 (上传 / 邮件轮询 / 重试) 只入账一次
    pub async fn ingest(
        &self,
        xml: &[u8],
        user_id: Option<i32>,
    ) -> Result<IngestOutcome, LedgerError> {
        // 1. 解析失败时没有任何副作用
        let doc = InvoiceDocument::parse(xml)?;
        let key = doc.access_key.as_str();

        // 2. 去重
        match self.find(key).await? {
            Some(invoice) if invoice.status == InvoiceStatus::Processed => {
                info!(access_key = key, items = invoice.total_items, "invoice already processed");
                return Ok(duplicate(key, invoice.total_items));
            }
            Some(_) => {
                debug!(access_key = key, "invoice pending from an earlier attempt, resuming");
            }
            None => {
                let inserted = self
                    .store
                    .register_pending(&doc.to_new_invoice(xml))
                    .await
                    .map_err(|source| LedgerError::Transaction { key: key.to_string(), source })?;

                if inserted {
                    self.announce(&doc);
                } else {
                    // 并发提交抢先登记: 重新读取后按幂等处理
                    if let Some(invoice) = self.find(key).await? {
                        if invoice.status == InvoiceStatus::Processed {
                            return Ok(duplicate(key, invoice.total_items));
                        }
                    }
                    debug!(access_key = key, "invoice registered concurrently, joining");
                }
            }
        }

        // 3-5. 单事务入账
        self.apply(&doc, user_id).await
    }

    /// 手工重试: 用已保存的 XML 重新入账 PENDING 发票
    pub async fn retry_pending(&self, access_key: &str) -> Result<IngestOutcome, LedgerError> {
        let invoice = self
            .find(access_key)
            .await?
            .ok_or_else(|| LedgerError::NotFound(access_key.to_string()))?;

        if invoice.status == InvoiceStatus::Processed {
            return Ok(duplicate(access_key, invoice.total_items));
        }

        let doc = InvoiceDocument::parse(&invoice.raw_xml)?;
        let outcome = self.apply(&doc, None).await?;
        info!(access_key, items = outcome.item_count, "pending invoice approved manually");
        Ok(outcome)
    }

    async fn find(&self, key: &str) -> Result<Option<ProcessedInvoice>, LedgerError> {
        self.store
            .find_invoice(key)
            .await
            .map_err(|source| LedgerError::Lookup { key: key.to_string(), source })
    }

    async fn apply(
        &self,
        doc: &InvoiceDocument,
        user_id: Option<i32>,
    ) -> Result<IngestOutcome, LedgerError> {
        let key = doc.access_key.as_str();
        match self.store.apply_entries(key, &doc.lines, user_id).await {
            Ok(ApplyOutcome::Applied { items }) => Ok(IngestOutcome {
                access_key: key.to_string(),
                item_count: items,
                duplicate: false,
            }),
            Ok(ApplyOutcome::AlreadyProcessed { total_items }) => Ok(duplicate(key, total_items)),
            Err(StoreError::InvoiceNotFound(key)) => Err(LedgerError::NotFound(key)),
            Err(source) => Err(LedgerError::Transaction { key: key.to_string(), source }),
        }
    }

    fn announce(&self, doc: &InvoiceDocument) {
        let notified = std::panic::catch_unwind(AssertUnwindSafe(|| {
            notify_new_invoice(
                self.notifier.as_ref(),
                &doc.access_key,
                doc.number.as_deref(),
                doc.supplier_name.as_deref(),
            )
        }));
        if notified.is_err() {
            warn!(access_key = %doc.access_key, "new invoice notification failed");
        }
    }
}

fn duplicate(key: &str, total_items: i32) -> IngestOutcome {
    IngestOutcome {
        access_key: key.to_string(),
        item_count: usize::try_from(total_items).unwrap_or_default(),
        duplicate: true,
    }
}

#[async_trait]
impl JobHandler for LedgerProcessor {
    type Job = IngestJob;
    type Output = IngestResult;

    async fn handle(&self, job: IngestJob, worker_id: usize) -> IngestResult {
        info!(
            worker_id,
            submitter = %job.submitter_label,
            xml_size = job.xml_bytes.len(),
            "Processing NFe"
        );

        match self.ingest(&job.xml_bytes, job.submitter_id).await {
            Ok(outcome) => {
                info!(
                    worker_id,
                    access_key = %outcome.access_key,
                    items = outcome.item_count,
                    duplicate = outcome.duplicate,
                    "NFe processed successfully"
                );
                IngestResult::processed(outcome.access_key, outcome.item_count, outcome.duplicate)
            }
            Err(e) => {
                error!(
                    worker_id,
                    access_key = e.invoice_key().unwrap_or("-"),
                    error = %e,
                    "Error processing NFe"
                );
                IngestResult::failed(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::error::FailureKind;
    use crate::models::invoice::tests::sample_xml;
    use crate::models::MovementType;
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use serde_json::Value;
    use std::str::FromStr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event_type: &str, _message: &str, data: Value) {
            self.events.lock().unwrap().push((event_type.to_string(), data));
        }
    }

    struct PanickingNotifier;

    impl Notifier for PanickingNotifier {
        fn notify(&self, _event_type: &str, _message: &str, _data: Value) {
            panic!("hub unavailable");
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<RecordingNotifier>, LedgerProcessor) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = LedgerProcessor::new(store.clone(), notifier.clone());
        (store, notifier, processor)
    }

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    /// 余额 == 入库合计 - 出库合计
    fn assert_reconciled(store: &MemoryStore, code: &str) {
        let sum = store
            .movements_for(code)
            .iter()
            .fold(BigDecimal::from(0), |acc, m| acc + m.signed_quantity());
        let stock = store.stock_of(code).unwrap_or_else(|| BigDecimal::from(0));
        assert_eq!(stock, sum, "ledger drift on {}", code);
    }

    #[tokio::test]
    async fn same_invoice_twice_counts_stock_once() {
        let (store, notifier, processor) = setup();
        let xml = sample_xml("NFE-001", &[("P1", "Parafuso", "10", "1.50")]);

        let first = processor.ingest(&xml, None).await.unwrap();
        assert_eq!(first.item_count, 1);
        assert!(!first.duplicate);
        assert_eq!(store.stock_of("P1"), Some(dec("10")));

        let second = processor.ingest(&xml, None).await.unwrap();
        assert_eq!(second.item_count, 1);
        assert!(second.duplicate);
        assert_eq!(store.stock_of("P1"), Some(dec("10")));

        assert_eq!(store.invoice_count(), 1);
        assert_eq!(store.invoice("NFE-001").unwrap().status, InvoiceStatus::Processed);
        assert_eq!(store.movements_for("P1").len(), 1);
        assert_eq!(notifier.events.lock().unwrap().len(), 1);
        assert_reconciled(&store, "P1");
    }

    #[tokio::test]
    async fn concurrent_duplicates_apply_once() {
        let (store, _notifier, processor) = setup();
        let processor = Arc::new(processor);
        let xml = sample_xml(
            "NFE-010",
            &[("P1", "Parafuso", "4", "1.00"), ("P2", "Porca", "6", "0.10")],
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let processor = Arc::clone(&processor);
                let xml = xml.clone();
                tokio::spawn(async move { processor.ingest(&xml, None).await })
            })
            .collect();

        let mut applied = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert_eq!(outcome.item_count, 2);
            if !outcome.duplicate {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(store.stock_of("P1"), Some(dec("4")));
        assert_eq!(store.stock_of("P2"), Some(dec("6")));
        assert_eq!(store.movement_count(), 2);
    }

    #[tokio::test]
    async fn resubmission_refreshes_product_and_accumulates_stock() {
        let (store, _notifier, processor) = setup();
        processor
            .ingest(&sample_xml("NFE-100", &[("P1", "Parafuso", "10", "1.50")]), Some(7))
            .await
            .unwrap();
        processor
            .ingest(&sample_xml("NFE-101", &[("P1", "Parafuso Inox", "5.5", "2.10")]), None)
            .await
            .unwrap();

        let product = store.product("P1").unwrap();
        assert_eq!(product.name, "Parafuso Inox");
        assert_eq!(product.cost_price, dec("2.10"));
        assert_eq!(product.unit, "UN");
        assert_eq!(store.stock_of("P1"), Some(dec("15.5")));

        let movements = store.movements_for("P1");
        assert_eq!(movements.len(), 2);
        assert!(movements.iter().all(|m| m.movement_type == MovementType::Entrada));
        assert_eq!(movements[0].reference.as_deref(), Some("NFE-100"));
        assert_eq!(movements[0].user_id, Some(7));
        assert_eq!(movements[1].origin.as_deref(), Some("NFE"));

        // 出库后余额仍与流水一致
        store.record_movement("P1", MovementType::Saida, dec("3"), Utc::now());
        assert_eq!(store.stock_of("P1"), Some(dec("12.5")));
        assert_reconciled(&store, "P1");
    }

    #[tokio::test]
    async fn malformed_xml_has_no_side_effects() {
        let (store, notifier, processor) = setup();
        let err = processor.ingest(b"<nfeProc><NFe>", None).await.unwrap_err();

        assert!(matches!(err, LedgerError::Parse(_)));
        assert_eq!(err.kind(), FailureKind::Parse);
        assert_eq!(store.invoice_count(), 0);
        assert_eq!(store.movement_count(), 0);
        assert!(notifier.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back_and_can_be_retried() {
        let (store, _notifier, processor) = setup();
        let xml = sample_xml(
            "NFE-200",
            &[("P1", "Parafuso", "10", "1.00"), ("P2", "Porca", "3", "0.50")],
        );

        store.fail_on_product("P2");
        let err = processor.ingest(&xml, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Transaction { ref key, .. } if key == "NFE-200"));
        assert_eq!(err.invoice_key(), Some("NFE-200"));

        // 第一行也没有落账
        assert_eq!(store.invoice("NFE-200").unwrap().status, InvoiceStatus::Pending);
        assert_eq!(store.stock_of("P1"), None);
        assert!(store.product("P1").is_none());
        assert_eq!(store.movement_count(), 0);

        store.clear_failures();
        let outcome = processor.ingest(&xml, None).await.unwrap();
        assert_eq!(outcome.item_count, 2);
        assert!(!outcome.duplicate);
        assert_eq!(store.stock_of("P1"), Some(dec("10")));
        assert_eq!(store.invoice("NFE-200").unwrap().status, InvoiceStatus::Processed);
    }

    #[tokio::test]
    async fn retry_pending_uses_stored_xml() {
        let (store, _notifier, processor) = setup();
        let xml = sample_xml("NFE-300", &[("P9", "Arruela", "2", "0.05")]);

        store.fail_on_product("P9");
        processor.ingest(&xml, None).await.unwrap_err();
        store.clear_failures();

        let outcome = processor.retry_pending("NFE-300").await.unwrap();
        assert_eq!(outcome.item_count, 1);
        assert_eq!(store.stock_of("P9"), Some(dec("2")));

        let again = processor.retry_pending("NFE-300").await.unwrap();
        assert!(again.duplicate);
        assert_eq!(store.stock_of("P9"), Some(dec("2")));

        assert!(matches!(processor.retry_pending("NFE-404").await, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn notifier_panic_does_not_fail_ingestion() {
        let store = Arc::new(MemoryStore::new());
        let processor = LedgerProcessor::new(store.clone(), Arc::new(PanickingNotifier));

        let outcome = processor
            .ingest(&sample_xml("NFE-400", &[("P1", "Parafuso", "1", "1.00")]), None)
            .await
            .unwrap();
        assert_eq!(outcome.item_count, 1);
        assert_eq!(store.stock_of("P1"), Some(dec("1")));
    }

    #[tokio::test]
    async fn handler_maps_outcomes_to_results() {
        let (_store, _notifier, processor) = setup();
        let xml = sample_xml("NFE-500", &[("P1", "Parafuso", "1", "1.00")]);

        let ok = processor.handle(IngestJob::new(xml.clone(), "ops@example.com"), 0).await;
        assert!(ok.success);
        assert_eq!(ok.invoice_key, "NFE-500");
        assert_eq!(ok.item_count, 1);

        let dup = processor.handle(IngestJob::new(xml, "mail-poller"), 1).await;
        assert!(dup.success && dup.duplicate);

        let bad = processor.handle(IngestJob::new(b"not xml".to_vec(), "upload"), 0).await;
        assert!(!bad.success);
        assert_eq!(bad.failure, Some(FailureKind::Parse));
        assert!(bad.error.is_some());
    }
}
