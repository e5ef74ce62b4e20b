//! Goods receipt notes: inspection of incoming material before it is posted to
//! the ledger.

pub mod grn;

pub use grn::{
    GoodsInspected, GoodsReceipt, GoodsReceiptCommand, GoodsReceiptEvent, GoodsReceiptId,
    GoodsReceiptPosted, GoodsReceiptRejected, GoodsReceived, InspectGoods, PostGoodsReceipt,
    ReceiptSource, RecordGoodsReceipt, RejectGoodsReceipt, GrnStatus,
};
