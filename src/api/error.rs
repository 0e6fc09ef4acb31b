use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("failed to call aggregator API: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response schema: {0}")]
    Schema(String),
}
