use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type ReaperResult<T> = Result<T, ReaperError>;
