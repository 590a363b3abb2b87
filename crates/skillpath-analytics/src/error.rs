use skillpath_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
