//! Binds one external rendering surface to the active document.
//!
//! Every activation gets an [`Activation`] tag. Attachment runs in a spawned task
//! and publishes its settlement on a watch channel. Code after each suspension
//! point compares its captured tag with the current binding and turns a mismatch
//! into [`ViewerError::StaleNavigation`], which is dropped rather than surfaced.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::ViewerOptions;
use crate::error::{ViewerError, ViewerResult};
use crate::navigation::{NavigationChannel, NavigationRequest, Subscription};
use crate::{Document, DocumentHandle, DocumentId, EventLog, SessionEvent};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountPoint(String);

impl MountPoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The third-party capability that paints documents into a mount point.
#[async_trait]
pub trait RenderingEngine: Send + Sync {
    /// Resolves once the engine can accept documents. Implementations resolve it
    /// once per process; later calls return immediately.
    async fn ready(&self) -> anyhow::Result<()>;

    async fn attach(
        &self,
        mount: &MountPoint,
        options: &ViewerOptions,
        handle: &DocumentHandle,
    ) -> anyhow::Result<()>;

    /// Live API of the most recently attached document.
    async fn live_api(&self) -> anyhow::Result<Arc<dyn PageControl>>;
}

#[async_trait]
pub trait PageControl: Send + Sync {
    /// `page` is 1-based.
    async fn goto_page(&self, page: NonZeroU32) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
    Replaced,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub document: DocumentId,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    Jumped,
    /// No attachment had begun yet; the request waits for the first activation.
    Buffered,
    /// The target document stopped being active while the request was in flight.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttachStatus {
    Pending,
    Ready,
    Failed(String),
}

struct Binding {
    activation: Activation,
    name: String,
    state: SessionState,
    attachment: watch::Receiver<AttachStatus>,
    /// Runs ready, attach and any buffered request. Aborted when superseded,
    /// which also drops its watch sender and wakes every waiter.
    task: Option<JoinHandle<()>>,
}

struct Shared {
    epoch: u64,
    binding: Option<Binding>,
    buffered: Option<NavigationRequest>,
    disposed: bool,
}

struct Inner {
    engine: Arc<dyn RenderingEngine>,
    mount: MountPoint,
    options: ViewerOptions,
    shared: Mutex<Shared>,
    events: EventLog,
}

#[derive(Clone)]
pub struct RendererSession {
    inner: Arc<Inner>,
}

impl RendererSession {
    pub fn new(
        engine: Arc<dyn RenderingEngine>,
        mount: MountPoint,
        options: ViewerOptions,
        events: EventLog,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                mount,
                options,
                shared: Mutex::new(Shared {
                    epoch: 0,
                    binding: None,
                    buffered: None,
                    disposed: false,
                }),
                events,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        let shared = self.inner.shared.lock();
        if shared.disposed {
            return SessionState::Disposed;
        }
        shared
            .binding
            .as_ref()
            .map(|b| b.state.clone())
            .unwrap_or(SessionState::Uninitialized)
    }

    /// State of the binding created by `activation`. Earlier activations report
    /// [`SessionState::Replaced`].
    pub fn state_of(&self, activation: Activation) -> SessionState {
        let shared = self.inner.shared.lock();
        if shared.disposed {
            return SessionState::Disposed;
        }
        match shared.binding.as_ref() {
            Some(binding) if binding.activation == activation => binding.state.clone(),
            _ if activation.epoch <= shared.epoch => SessionState::Replaced,
            _ => SessionState::Uninitialized,
        }
    }

    pub fn current(&self) -> Option<Activation> {
        self.inner
            .shared
            .lock()
            .binding
            .as_ref()
            .map(|b| b.activation)
    }

    pub fn bound_document_name(&self) -> Option<String> {
        self.inner
            .shared
            .lock()
            .binding
            .as_ref()
            .map(|b| b.name.clone())
    }

    /// Starts binding `document`, superseding whatever was bound before.
    #[instrument(skip(self, document), fields(document = %document.name))]
    pub fn activate(&self, document: &Document) -> ViewerResult<Activation> {
        let runtime = Handle::try_current()
            .map_err(|_| ViewerError::EngineAcquisition("no async runtime available".into()))?;

        let (tx, rx) = watch::channel(AttachStatus::Pending);
        let activation = {
            let mut shared = self.inner.shared.lock();
            if shared.disposed {
                return Err(ViewerError::EngineAcquisition(
                    "renderer session disposed".into(),
                ));
            }
            shared.epoch += 1;
            let activation = Activation {
                document: document.id,
                epoch: shared.epoch,
            };
            let previous = shared.binding.take().and_then(|mut previous| {
                debug!(replaced = %previous.name, epoch = previous.activation.epoch, "binding replaced");
                previous.task.take()
            });
            if let Some(task) = previous.as_ref() {
                task.abort();
            }
            let buffered = shared.buffered.take();

            // Spawned under the lock so a later activation always finds this task.
            let session = self.clone();
            let handle = document.handle.clone();
            let attachment = rx.clone();
            let task = runtime.spawn(async move {
                // The superseded attachment must be gone before this one starts.
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                let Some(status) = session.acquire_and_attach(activation, &handle).await else {
                    return;
                };
                session.settle(activation, &status);
                tx.send_replace(status);

                if let Some(request) = buffered {
                    let result = session.dispatch(activation, attachment, request).await;
                    session.report_navigation(request, result);
                }
            });

            shared.binding = Some(Binding {
                activation,
                name: document.name.clone(),
                state: SessionState::Initializing,
                attachment: rx,
                task: Some(task),
            });
            activation
        };
        self.push_event(SessionEvent::ActiveDocumentChanged(document.id));

        Ok(activation)
    }

    /// Returns `None` when the binding was superseded while the engine got ready.
    async fn acquire_and_attach(
        &self,
        activation: Activation,
        handle: &DocumentHandle,
    ) -> Option<AttachStatus> {
        let engine = &self.inner.engine;
        if let Err(err) = engine.ready().await {
            let err = err.context("rendering engine did not become ready");
            return Some(AttachStatus::Failed(format!("{:#}", err)));
        }
        if !self.is_current(activation) {
            debug!(epoch = activation.epoch, "superseded before attach");
            return None;
        }

        let result = async {
            engine
                .attach(&self.inner.mount, &self.inner.options, handle)
                .await
                .with_context(|| format!("failed to attach {}", handle.location.display()))
        }
        .await;

        Some(match result {
            Ok(()) => AttachStatus::Ready,
            Err(err) => AttachStatus::Failed(format!("{:#}", err)),
        })
    }

    fn settle(&self, activation: Activation, status: &AttachStatus) {
        let mut shared = self.inner.shared.lock();
        let Some(binding) = shared
            .binding
            .as_mut()
            .filter(|b| b.activation == activation)
        else {
            debug!(epoch = activation.epoch, "attachment settled for a superseded binding");
            return;
        };

        match status {
            AttachStatus::Ready => {
                binding.state = SessionState::Ready;
                drop(shared);
                debug!(epoch = activation.epoch, "surface ready");
                self.push_event(SessionEvent::SurfaceReady(activation.document));
            }
            AttachStatus::Failed(message) => {
                binding.state = SessionState::Failed(message.clone());
                drop(shared);
                warn!(epoch = activation.epoch, %message, "surface failed");
                self.push_event(SessionEvent::SurfaceFailed {
                    document: activation.document,
                    message: message.clone(),
                });
            }
            AttachStatus::Pending => {}
        }
    }

    /// Waits for the current attachment to settle and reports the resulting state.
    pub async fn wait_settled(&self) -> SessionState {
        let rx = {
            let shared = self.inner.shared.lock();
            match shared.binding.as_ref() {
                Some(binding) => binding.attachment.clone(),
                None => return SessionState::Uninitialized,
            }
        };
        let _ = wait_attachment(rx).await;
        self.state()
    }

    /// Jumps the bound surface to the requested page once its attachment settles.
    #[instrument(skip(self), fields(page = request.page()))]
    pub async fn navigate_to_page(
        &self,
        request: NavigationRequest,
    ) -> ViewerResult<NavigationOutcome> {
        let (activation, rx) = {
            let mut shared = self.inner.shared.lock();
            if shared.disposed {
                return Ok(NavigationOutcome::Dropped);
            }
            match shared.binding.as_ref() {
                Some(binding) => (binding.activation, binding.attachment.clone()),
                None => {
                    debug!("no attachment yet, buffering request");
                    shared.buffered = Some(request);
                    return Ok(NavigationOutcome::Buffered);
                }
            }
        };

        let dropped = self.finish_navigation(self.dispatch(activation, rx, request).await)?;
        Ok(if dropped {
            NavigationOutcome::Dropped
        } else {
            NavigationOutcome::Jumped
        })
    }

    /// Folds a stale result into a silent drop. Returns `Ok(true)` when dropped.
    fn finish_navigation(&self, result: ViewerResult<()>) -> ViewerResult<bool> {
        match result {
            Ok(()) => Ok(false),
            Err(ViewerError::StaleNavigation) => Ok(true),
            Err(err) => Err(err),
        }
    }

    async fn dispatch(
        &self,
        activation: Activation,
        rx: watch::Receiver<AttachStatus>,
        request: NavigationRequest,
    ) -> ViewerResult<()> {
        let status = wait_attachment(rx).await;
        self.ensure_current(activation, request)?;

        match status {
            Some(AttachStatus::Ready) => {}
            Some(AttachStatus::Failed(message)) => {
                return Err(ViewerError::EngineAcquisition(message))
            }
            Some(AttachStatus::Pending) | None => {
                return Err(ViewerError::EngineAcquisition(
                    "attachment ended without settling".into(),
                ))
            }
        }

        let api = self
            .inner
            .engine
            .live_api()
            .await
            .map_err(|err| ViewerError::EngineAcquisition(format!("{:#}", err)))?;
        self.ensure_current(activation, request)?;

        api.goto_page(request.target_page)
            .await
            .map_err(|err| ViewerError::EngineAcquisition(format!("{:#}", err)))?;
        debug!(page = request.page(), epoch = activation.epoch, "jumped to page");
        self.push_event(SessionEvent::NavigationApplied {
            document: activation.document,
            page: request.page(),
        });
        Ok(())
    }

    fn is_current(&self, activation: Activation) -> bool {
        let shared = self.inner.shared.lock();
        !shared.disposed
            && shared
                .binding
                .as_ref()
                .map(|b| b.activation == activation)
                .unwrap_or(false)
    }

    fn ensure_current(
        &self,
        activation: Activation,
        request: NavigationRequest,
    ) -> ViewerResult<()> {
        if self.is_current(activation) {
            return Ok(());
        }
        debug!(page = request.page(), epoch = activation.epoch, "dropping stale navigation");
        self.push_event(SessionEvent::NavigationDropped {
            page: request.page(),
        });
        Err(ViewerError::StaleNavigation)
    }

    /// Routes channel requests to this session, one at a time in publish order.
    pub fn subscribe_to(&self, channel: &NavigationChannel) -> ViewerResult<Subscription> {
        let runtime = Handle::try_current()
            .map_err(|_| ViewerError::EngineAcquisition("no async runtime available".into()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<NavigationRequest>();

        let session = self.clone();
        runtime.spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = session.navigate_to_page(request).await.map(|_| ());
                session.report_navigation(request, result);
            }
        });

        Ok(channel.subscribe(move |request| {
            if tx.send(request).is_err() {
                debug!(page = request.page(), "renderer session gone, request lost");
            }
        }))
    }

    /// Stale drops were already recorded; any other failure becomes a
    /// [`SessionEvent::NavigationFailed`] for the shell.
    fn report_navigation(&self, request: NavigationRequest, result: ViewerResult<()>) {
        match self.finish_navigation(result) {
            Ok(_) => {}
            Err(err) => {
                warn!(%err, page = request.page(), "navigation request failed");
                self.push_event(SessionEvent::NavigationFailed {
                    page: request.page(),
                    message: err.to_string(),
                });
            }
        }
    }

    pub fn dispose(&self) {
        let mut shared = self.inner.shared.lock();
        shared.disposed = true;
        shared.buffered = None;
        if let Some(binding) = shared.binding.as_mut() {
            binding.state = SessionState::Disposed;
            if let Some(task) = binding.task.take() {
                task.abort();
            }
        }
        debug!("renderer session disposed");
    }

    fn push_event(&self, event: SessionEvent) {
        self.inner.events.lock().push(event);
    }
}

async fn wait_attachment(mut rx: watch::Receiver<AttachStatus>) -> Option<AttachStatus> {
    let status = rx
        .wait_for(|status| *status != AttachStatus::Pending)
        .await
        .ok()
        .map(|status| status.clone());
    status
}
