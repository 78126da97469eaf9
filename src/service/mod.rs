pub mod export;
pub mod ledger;
pub mod notify;

pub use export::{sweep_stale_exports, ExportFile, ExportProcessor};
pub use ledger::{IngestOutcome, LedgerProcessor};
pub use notify::{LogNotifier, Notifier};
