pub mod decision;
pub mod image_store;
pub mod transfer;
pub mod worker;

pub use decision::{decide, SkipReason, SyncAction};
pub use image_store::{ImageStore, InFlightMarkers};
pub use transfer::{FileTransfer, RsyncTransfer, TransferOutcome, TransferRequest};
pub use worker::{SyncWorker, SyncWorkerSettings};
