use thiserror::Error;

use crate::conv::TensorType;

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("invalid convolution parameter: {0}")]
    InvalidParam(String),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error("{what} has {actual} elements, expected {expected}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what} element type is {actual:?}, operator expects {expected:?}")]
    TypeMismatch {
        what: &'static str,
        expected: TensorType,
        actual: TensorType,
    },
    #[error("external buffer holds {actual} bytes, {required} required")]
    BufferTooSmall { required: usize, actual: usize },
    #[error("weights were not set before forward")]
    ParamsNotSet,
    #[error("invalid engine override: {0}")]
    InvalidEngineOverride(String),
    #[error("engine {0} is not available on this CPU")]
    EngineUnavailable(&'static str),
}

pub type ConvResult<T> = Result<T, ConvError>;

impl ConvError {
    pub(crate) fn size(what: &'static str, expected: usize, actual: usize) -> Self {
        ConvError::SizeMismatch {
            what,
            expected,
            actual,
        }
    }
}
