use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unsupported feature: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Common(#[from] aurora_common::Error),
}

pub type Result<T> = std::result::Result<T, DecoderError>;
