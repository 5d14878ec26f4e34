use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod navigation;
pub mod renderer;
pub mod session;

pub use config::{ChannelPolicy, ViewerConfig, ViewerOptions};
pub use error::{ViewerError, ViewerResult};
pub use navigation::{NavigationChannel, NavigationRequest, Subscription};
pub use renderer::{
    Activation, MountPoint, NavigationOutcome, PageControl, RendererSession, RenderingEngine,
    SessionState,
};
pub use session::ViewingSession;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f1d7c2a-5b8e-5f0a-9c44-1e6b2d9a7c10").expect("valid namespace UUID")
});

/// Documents are identified by name; names are unique within a set.
pub fn document_id_for_name(name: &str) -> DocumentId {
    Uuid::new_v5(&DOCUMENT_NAMESPACE, name.as_bytes())
}

/// A file accepted by the picker, not yet loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub path: PathBuf,
}

impl SourceFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("{:?} has no usable file name", path))?;
        Ok(Self { name, path })
    }
}

/// Loadable reference to a document's bytes. Cheap to clone; the bytes stay on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    pub id: DocumentId,
    pub location: Arc<Path>,
    pub byte_len: u64,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    pub handle: DocumentHandle,
}

impl Document {
    pub fn label(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }
}

pub trait HandleAllocator: Send + Sync {
    fn allocate(&self, file: &SourceFile) -> Result<DocumentHandle>;
    fn release(&self, handle: &DocumentHandle);
}

/// Hands out handles pointing at files on the local filesystem.
#[derive(Debug, Default)]
pub struct FileHandleAllocator;

impl HandleAllocator for FileHandleAllocator {
    fn allocate(&self, file: &SourceFile) -> Result<DocumentHandle> {
        let location = file
            .path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", file.path))?;
        let metadata = fs::metadata(&location)
            .with_context(|| format!("failed to stat {:?}", location))?;
        if !metadata.is_file() {
            return Err(anyhow!("{:?} is not a regular file", location));
        }
        Ok(DocumentHandle {
            id: document_id_for_name(&file.name),
            location: Arc::from(location.as_path()),
            byte_len: metadata.len(),
        })
    }

    fn release(&self, handle: &DocumentHandle) {
        debug!(path = %handle.location.display(), "released document handle");
    }
}

/// Tracks live handles in memory; used where no filesystem is involved.
pub struct MemoryHandleAllocator {
    live: Mutex<HashSet<DocumentId>>,
}

impl MemoryHandleAllocator {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashSet::new()),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_live(&self, id: &DocumentId) -> bool {
        self.live.lock().contains(id)
    }
}

impl Default for MemoryHandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleAllocator for MemoryHandleAllocator {
    fn allocate(&self, file: &SourceFile) -> Result<DocumentHandle> {
        let id = document_id_for_name(&file.name);
        self.live.lock().insert(id);
        Ok(DocumentHandle {
            id,
            location: Arc::from(file.path.as_path()),
            byte_len: 0,
        })
    }

    fn release(&self, handle: &DocumentHandle) {
        self.live.lock().remove(&handle.id);
    }
}

/// Ordered documents in upload order plus the active index.
pub struct DocumentSet {
    documents: Vec<Document>,
    active: Option<usize>,
    allocator: Arc<dyn HandleAllocator>,
}

impl DocumentSet {
    pub fn new(allocator: Arc<dyn HandleAllocator>) -> Self {
        Self {
            documents: Vec::new(),
            active: None,
            allocator,
        }
    }

    /// Replaces the whole set. On failure the previous set is left untouched.
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub fn replace(&mut self, files: Vec<SourceFile>) -> ViewerResult<()> {
        if files.is_empty() {
            return Err(ViewerError::EmptyInput);
        }

        {
            let mut seen = HashSet::new();
            for file in &files {
                if !seen.insert(file.name.as_str()) {
                    return Err(ViewerError::DuplicateDocument(file.name.clone()));
                }
            }
        }

        let mut next = Vec::with_capacity(files.len());
        for file in files {
            match self.allocator.allocate(&file) {
                Ok(handle) => next.push(Document {
                    id: handle.id,
                    name: file.name,
                    handle,
                }),
                Err(err) => {
                    for doc in &next {
                        self.allocator.release(&doc.handle);
                    }
                    return Err(ViewerError::Handle(format!("{}: {:#}", file.name, err)));
                }
            }
        }

        let previous = std::mem::replace(&mut self.documents, next);
        for doc in &previous {
            self.allocator.release(&doc.handle);
        }
        self.active = Some(0);
        debug!(len = self.documents.len(), "document set replaced");
        Ok(())
    }

    pub fn select(&mut self, index: usize) -> ViewerResult<&Document> {
        if index >= self.documents.len() {
            return Err(ViewerError::OutOfRange {
                index,
                len: self.documents.len(),
            });
        }
        self.active = Some(index);
        Ok(&self.documents[index])
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active(&self) -> Option<&Document> {
        self.active.and_then(|idx| self.documents.get(idx))
    }

    pub fn get(&self, index: usize) -> Option<&Document> {
        self.documents.get(index)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.documents.iter().position(|doc| doc.name == name)
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Releases every handle and empties the set.
    pub fn clear(&mut self) {
        for doc in self.documents.drain(..) {
            self.allocator.release(&doc.handle);
        }
        self.active = None;
    }
}

impl Drop for DocumentSet {
    fn drop(&mut self) {
        self.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DocumentsReplaced { count: usize },
    ActiveDocumentChanged(DocumentId),
    SurfaceReady(DocumentId),
    SurfaceFailed { document: DocumentId, message: String },
    NavigationApplied { document: DocumentId, page: u32 },
    NavigationDropped { page: u32 },
    /// A channel or buffered jump failed with nobody awaiting it.
    NavigationFailed { page: u32, message: String },
}

pub type EventLog = Arc<Mutex<Vec<SessionEvent>>>;
