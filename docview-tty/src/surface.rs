use std::fs::File;
use std::io::Read;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use docview_core::{
    DocumentHandle, DocumentId, MountPoint, PageControl, RenderingEngine, ViewerOptions,
};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const PDF_MAGIC: &[u8] = b"%PDF-";

/// What the terminal currently shows in place of a painted page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceView {
    pub mount: MountPoint,
    pub document: DocumentId,
    pub location: PathBuf,
    pub byte_len: u64,
    pub page: u32,
    pub options: ViewerOptions,
}

/// Rendering engine for terminals that cannot paint PDF pages.
///
/// Attaching checks that the handle points at PDF bytes and records the binding;
/// page jumps update the page shown in the status line.
#[derive(Default)]
pub struct TerminalSurface {
    ready: OnceCell<()>,
    initializations: AtomicUsize,
    view: Arc<Mutex<Option<SurfaceView>>>,
}

impl TerminalSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> Option<SurfaceView> {
        self.view.lock().clone()
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderingEngine for TerminalSurface {
    async fn ready(&self) -> Result<()> {
        self.ready
            .get_or_init(|| async {
                self.initializations.fetch_add(1, Ordering::SeqCst);
                debug!("terminal surface initialized");
            })
            .await;
        Ok(())
    }

    async fn attach(
        &self,
        mount: &MountPoint,
        options: &ViewerOptions,
        handle: &DocumentHandle,
    ) -> Result<()> {
        let location = handle.location.to_path_buf();
        let header_path = location.clone();
        tokio::task::spawn_blocking(move || check_pdf_header(&header_path))
            .await
            .context("header check task failed")??;

        info!(mount = %mount, path = %location.display(), "document attached to terminal surface");
        *self.view.lock() = Some(SurfaceView {
            mount: mount.clone(),
            document: handle.id,
            location,
            byte_len: handle.byte_len,
            page: 1,
            options: *options,
        });
        Ok(())
    }

    async fn live_api(&self) -> Result<Arc<dyn PageControl>> {
        let document = self
            .view
            .lock()
            .as_ref()
            .map(|view| view.document)
            .ok_or_else(|| anyhow!("no document attached"))?;
        Ok(Arc::new(SurfaceControl {
            document,
            view: Arc::clone(&self.view),
        }))
    }
}

struct SurfaceControl {
    document: DocumentId,
    view: Arc<Mutex<Option<SurfaceView>>>,
}

#[async_trait]
impl PageControl for SurfaceControl {
    async fn goto_page(&self, page: NonZeroU32) -> Result<()> {
        let mut guard = self.view.lock();
        match guard.as_mut() {
            Some(view) if view.document == self.document => {
                view.page = page.get();
                Ok(())
            }
            _ => bail!("document {} is no longer attached", self.document),
        }
    }
}

fn check_pdf_header(path: &Path) -> Result<()> {
    let mut file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut header = [0u8; 5];
    let read = file
        .read(&mut header)
        .with_context(|| format!("failed to read {:?}", path))?;
    if &header[..read] != PDF_MAGIC {
        bail!("{:?} is not a PDF document", path);
    }
    Ok(())
}
