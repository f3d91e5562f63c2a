use thiserror::Error;

/// Kind of binding slot named in [`BufferCacheError::SlotOutOfRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Vertex,
    Uniform,
    Storage,
    Texture,
    TransformFeedback,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferCacheError {
    #[error("{kind:?} slot {index} out of range (max {max})")]
    SlotOutOfRange {
        kind: SlotKind,
        index: u32,
        max: u32,
    },
    #[error("invalid buffer cache config: {0}")]
    InvalidConfig(&'static str),
}
