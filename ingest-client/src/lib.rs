//! Client side of document ingestion: submit a document, then observe its
//! session until the server reports a terminal state or the polling budget runs out.

mod error;
mod poller;
mod source;
pub mod wire;

pub use error::PollError;
pub use poller::{PollConfig, PollOutcome, PollingClient};
pub use source::{DocumentUpload, HttpStatusSource, StatusSource};
pub use tokio_util::sync::CancellationToken;
