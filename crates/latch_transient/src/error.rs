use crate::ResourceHandle;
use latch_paging::PagingError;
use thiserror::Error;

/// Errors surfaced by the transient allocator and its device layer.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error(transparent)]
    Paging(#[from] PagingError),

    #[error("requested {requested} pages but {unsatisfied} could not be placed in any tier")]
    Exhausted { requested: u32, unsatisfied: u32 },

    #[error("descriptor does not request any bind usage")]
    NoUsage,

    #[error("allocator is not recording a frame; call next_frame first")]
    NotRecording,

    #[error("{pending_pools} page pool mappings were staged but never finalized")]
    UnfinalizedMappings { pending_pools: usize },

    #[error("transient resource {handle} is not currently acquired")]
    NotAcquired { handle: ResourceHandle },

    #[error("device failed to {operation}: {message}")]
    Device {
        operation: &'static str,
        message: String,
    },
}

impl TransientError {
    pub fn device(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Device {
            operation,
            message: message.into(),
        }
    }
}
