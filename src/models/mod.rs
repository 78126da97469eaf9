pub mod export;
pub mod invoice;
pub mod movement;
pub mod product;

pub use export::{ExportKind, MovementFilter, MovementRow, StockFilter, StockRow, StockStatus};
pub use invoice::{InvoiceDocument, InvoiceLine, InvoiceStatus, NewInvoice, ProcessedInvoice};
pub use movement::{Movement, MovementType, ORIGIN_NFE};
pub use product::Product;
