use skillpath_core::errors::TraceError;
use skillpath_store::StoreError;

/// Errors from the trace writer and reader: either the store failed (the
/// failure propagates unmodified, no retries here) or a persisted payload
/// could not be reconstructed.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Payload(#[from] TraceError),
}
