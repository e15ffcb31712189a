//! Transfer services: durable records, pacing, and orchestration.

pub mod governor;
mod orchestrator;
mod store;

pub use governor::{speed_limited, unthrottled, GovernedReader, Governor};
pub use orchestrator::{DownloadSink, TransferOrchestrator, UploadStats};
pub use store::{
    CompletionReason, TransferDirection, TransferRecord, TransferState, TransferStore,
};
