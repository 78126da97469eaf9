use serde_json::Value;

pub const EVENT_NEW_NFE: &str = "NEW_NFE";

/// 通知发布接口 (推送给 UI 的 hub 由外部实现).
/// 实现必须不阻塞, 失败自行吞掉: 通知失败不影响任务结果
pub trait Notifier: Send + Sync {
    fn notify(&self, event_type: &str, message: &str, data: Value);
}

/// 仅写日志的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event_type: &str, message: &str, data: Value) {
        tracing::info!(event_type, data = %data, "{}", message);
    }
}

/// 新发票登记通知
pub fn notify_new_invoice(
    notifier: &dyn Notifier,
    access_key: &str,
    number: Option<&str>,
    supplier: Option<&str>,
) {
    let number = number.unwrap_or("-");
    let supplier = supplier.unwrap_or("unknown supplier");
    let message = format!(
        "New invoice detected! No. {} from {} is awaiting approval.",
        number, supplier
    );
    notifier.notify(
        EVENT_NEW_NFE,
        &message,
        serde_json::json!({
            "access_key": access_key,
            "number": number,
            "supplier": supplier,
        }),
    );
}
