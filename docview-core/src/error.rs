use thiserror::Error;

pub type ViewerResult<T> = std::result::Result<T, ViewerError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ViewerError {
    #[error("no documents were submitted")]
    EmptyInput,

    #[error("document index {index} is out of range for {len} documents")]
    OutOfRange { index: usize, len: usize },

    /// The target document stopped being active while the request was in flight.
    /// Recovered inside the adapter by dropping the request.
    #[error("navigation target is no longer the active document")]
    StaleNavigation,

    #[error("rendering engine unavailable: {0}")]
    EngineAcquisition(String),

    #[error("{0}")]
    Upload(String),

    #[error("document {0:?} was submitted more than once")]
    DuplicateDocument(String),

    #[error("page numbers start at 1, got {0}")]
    InvalidPage(u32),

    #[error("at most {max} documents can be submitted, got {got}")]
    TooManyDocuments { max: usize, got: usize },

    #[error("unsupported file {0:?}")]
    UnsupportedFile(String),

    #[error("failed to allocate document handle: {0}")]
    Handle(String),
}

impl ViewerError {
    /// Errors the hosting shell should display. Stale navigation is recovered locally.
    pub fn is_surfaced(&self) -> bool {
        !matches!(self, Self::StaleNavigation)
    }
}
