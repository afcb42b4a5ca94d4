use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Mirror error: {0}")]
    Mirror(#[from] mirror_engine::MirrorError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
