use dagmetrics_source::SourceError;

pub type CollectResult<T> = Result<T, CollectError>;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("scrape deadline reached before {family} finished")]
    Timeout { family: &'static str },

    #[error("encoding error: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("exposition is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
