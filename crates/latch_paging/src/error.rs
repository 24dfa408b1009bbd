use crate::TierKind;
use thiserror::Error;

/// Errors raised while growing, shrinking or releasing into a tier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PagingError {
    #[error("device failed to {operation}: {message}")]
    Device {
        operation: &'static str,
        message: String,
    },

    #[error("page reference names {tier:?} block {index}, but only {block_count} blocks exist")]
    ForeignBlock {
        tier: TierKind,
        index: u32,
        block_count: usize,
    },
}

impl PagingError {
    pub fn device(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Device {
            operation,
            message: message.into(),
        }
    }
}
