//! Purchasing domain: purchase orders received in parts against GRNs.

pub mod order;

pub use order::{
    AddLine, CancelPurchaseOrder, CreatePurchaseOrder, PurchaseOrder, PurchaseOrderCancelled,
    PurchaseOrderClosed, PurchaseOrderCommand, PurchaseOrderCreated, PurchaseOrderEvent,
    PurchaseOrderId, PurchaseOrderLine, PurchaseOrderLineAdded, PurchaseOrderSent,
    PurchaseOrderStatus, ReceiptRecorded, RecordReceipt, SendPurchaseOrder, ShortClose,
};
