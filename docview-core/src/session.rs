use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::config::ViewerConfig;
use crate::error::{ViewerError, ViewerResult};
use crate::navigation::{NavigationChannel, NavigationRequest, Subscription};
use crate::renderer::{Activation, MountPoint, RendererSession, RenderingEngine, SessionState};
use crate::{Document, DocumentSet, EventLog, HandleAllocator, SessionEvent, SourceFile};

/// One viewing context: the document set, the renderer bound to its active
/// document, and the navigation channel connecting publishers to that renderer.
pub struct ViewingSession {
    documents: DocumentSet,
    renderer: RendererSession,
    channel: NavigationChannel,
    subscription: Option<Subscription>,
    events: EventLog,
    max_documents: usize,
}

impl ViewingSession {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &ViewerConfig,
        allocator: Arc<dyn HandleAllocator>,
        engine: Arc<dyn RenderingEngine>,
    ) -> ViewerResult<Self> {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let renderer = RendererSession::new(
            engine,
            MountPoint::new(config.mount_point.clone()),
            config.viewer,
            Arc::clone(&events),
        );
        let channel = NavigationChannel::new(config.channel);
        let subscription = renderer.subscribe_to(&channel)?;
        Ok(Self {
            documents: DocumentSet::new(allocator),
            renderer,
            channel,
            subscription: Some(subscription),
            events,
            max_documents: config.max_documents,
        })
    }

    /// Replaces the loaded documents and binds the renderer to the first one.
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub fn load(&mut self, files: Vec<SourceFile>) -> ViewerResult<Activation> {
        if files.len() > self.max_documents {
            return Err(ViewerError::TooManyDocuments {
                max: self.max_documents,
                got: files.len(),
            });
        }
        self.documents.replace(files)?;
        self.push_event(SessionEvent::DocumentsReplaced {
            count: self.documents.len(),
        });
        let first = self.documents.active().ok_or(ViewerError::EmptyInput)?;
        info!(count = self.documents.len(), "documents loaded");
        self.renderer.activate(first)
    }

    /// Selecting the already active document keeps the current binding.
    pub fn select(&mut self, index: usize) -> ViewerResult<Option<Activation>> {
        let previous = self.documents.active_index();
        let document = self.documents.select(index)?;
        if previous == Some(index) {
            debug!(index, "document already active");
            return Ok(None);
        }
        self.renderer.activate(document).map(Some)
    }

    pub fn select_next(&mut self) -> ViewerResult<Option<Activation>> {
        self.step(1)
    }

    pub fn select_previous(&mut self) -> ViewerResult<Option<Activation>> {
        self.step(-1)
    }

    fn step(&mut self, delta: isize) -> ViewerResult<Option<Activation>> {
        let len = self.documents.len() as isize;
        let Some(current) = self.documents.active_index() else {
            return Err(ViewerError::OutOfRange { index: 0, len: 0 });
        };
        let next = (current as isize + delta).rem_euclid(len) as usize;
        self.select(next)
    }

    /// Publishes a jump to `page` of whatever document is active.
    pub fn navigate(&self, page: u32) -> ViewerResult<usize> {
        let request = NavigationRequest::new(page)?;
        Ok(self.channel.publish(request))
    }

    /// Activates the document called `name`, then publishes a jump to `page`.
    pub fn open_reference(&mut self, name: &str, page: u32) -> ViewerResult<usize> {
        let request = NavigationRequest::new(page)?;
        let index = self
            .documents
            .position(name)
            .ok_or(ViewerError::OutOfRange {
                index: usize::MAX,
                len: self.documents.len(),
            })?;
        self.select(index)?;
        Ok(self.channel.publish(request))
    }

    pub fn channel(&self) -> &NavigationChannel {
        &self.channel
    }

    pub fn renderer(&self) -> &RendererSession {
        &self.renderer
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.documents
    }

    pub fn active(&self) -> Option<&Document> {
        self.documents.active()
    }

    pub fn state(&self) -> SessionState {
        self.renderer.state()
    }

    pub fn drain_events(&self) -> Vec<SessionEvent> {
        mem::take(&mut *self.events.lock())
    }

    /// Stops routing requests and releases every document handle.
    pub fn dispose(&mut self) {
        self.subscription.take();
        self.renderer.dispose();
        self.documents.clear();
    }

    fn push_event(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }
}

impl Drop for ViewingSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::num::NonZeroU32;
    use std::path::PathBuf;
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::config::ViewerOptions;
    use crate::renderer::PageControl;
    use crate::{DocumentHandle, MemoryHandleAllocator};

    #[derive(Default)]
    struct GatedEngine {
        gates: Mutex<HashMap<String, Arc<Notify>>>,
        attached: Mutex<Option<String>>,
        jumps: Arc<Mutex<Vec<(String, u32)>>>,
    }

    impl GatedEngine {
        fn gate(&self, name: &str) -> Arc<Notify> {
            let notify = Arc::new(Notify::new());
            self.gates.lock().insert(name.to_string(), notify.clone());
            notify
        }

        fn jumps(&self) -> Vec<(String, u32)> {
            self.jumps.lock().clone()
        }
    }

    struct Control {
        document: String,
        jumps: Arc<Mutex<Vec<(String, u32)>>>,
    }

    #[async_trait]
    impl PageControl for Control {
        async fn goto_page(&self, page: NonZeroU32) -> anyhow::Result<()> {
            self.jumps.lock().push((self.document.clone(), page.get()));
            Ok(())
        }
    }

    #[async_trait]
    impl RenderingEngine for GatedEngine {
        async fn ready(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn attach(
            &self,
            _mount: &MountPoint,
            _options: &ViewerOptions,
            handle: &DocumentHandle,
        ) -> anyhow::Result<()> {
            let name = handle
                .location
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let gate = self.gates.lock().get(&name).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            *self.attached.lock() = Some(name);
            Ok(())
        }

        async fn live_api(&self) -> anyhow::Result<Arc<dyn PageControl>> {
            let document = self
                .attached
                .lock()
                .clone()
                .ok_or_else(|| anyhow!("nothing attached"))?;
            Ok(Arc::new(Control {
                document,
                jumps: Arc::clone(&self.jumps),
            }))
        }
    }

    fn sources(names: &[&str]) -> Vec<SourceFile> {
        names
            .iter()
            .map(|n| SourceFile {
                name: n.to_string(),
                path: PathBuf::from(format!("/uploads/{n}")),
            })
            .collect()
    }

    fn session_with(engine: Arc<GatedEngine>) -> (ViewingSession, Arc<MemoryHandleAllocator>) {
        let allocator = Arc::new(MemoryHandleAllocator::new());
        let session =
            ViewingSession::new(&ViewerConfig::default(), allocator.clone(), engine).unwrap();
        (session, allocator)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn switching_before_attachment_settles_never_jumps_old_document() {
        let engine = Arc::new(GatedEngine::default());
        let (mut session, _) = session_with(engine.clone());

        session.load(sources(&["a.pdf", "b.pdf"])).unwrap();
        assert_eq!(session.documents().len(), 2);
        assert_eq!(session.documents().active_index(), Some(0));
        assert_eq!(session.renderer().wait_settled().await, SessionState::Ready);

        let gate_b = engine.gate("b.pdf");
        session.select(1).unwrap();
        assert_eq!(session.documents().active_index(), Some(1));

        assert_eq!(session.navigate(3).unwrap(), 1);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(engine.jumps().is_empty());

        gate_b.notify_one();
        let watched = engine.clone();
        eventually(|| !watched.jumps().is_empty()).await;
        assert_eq!(engine.jumps(), vec![("b.pdf".to_string(), 3)]);
    }

    #[tokio::test]
    async fn selecting_active_document_does_not_reattach() {
        let engine = Arc::new(GatedEngine::default());
        let (mut session, _) = session_with(engine);
        let first = session.load(sources(&["a.pdf", "b.pdf"])).unwrap();

        assert_eq!(session.select(0).unwrap(), None);
        assert_eq!(session.renderer().current(), Some(first));

        let next = session.select(1).unwrap().unwrap();
        assert_ne!(next.epoch, first.epoch);
    }

    #[tokio::test]
    async fn invalid_selection_keeps_binding() {
        let engine = Arc::new(GatedEngine::default());
        let (mut session, _) = session_with(engine);
        let first = session.load(sources(&["a.pdf"])).unwrap();

        assert_eq!(
            session.select(4).unwrap_err(),
            ViewerError::OutOfRange { index: 4, len: 1 }
        );
        assert_eq!(session.documents().active_index(), Some(0));
        assert_eq!(session.renderer().current(), Some(first));
    }

    #[tokio::test]
    async fn cycling_wraps_around() {
        let engine = Arc::new(GatedEngine::default());
        let (mut session, _) = session_with(engine);
        session.load(sources(&["a.pdf", "b.pdf", "c.pdf"])).unwrap();

        session.select_previous().unwrap();
        assert_eq!(session.documents().active_index(), Some(2));
        session.select_next().unwrap();
        assert_eq!(session.documents().active_index(), Some(0));
    }

    #[tokio::test]
    async fn open_reference_selects_document_then_jumps() {
        let engine = Arc::new(GatedEngine::default());
        let (mut session, _) = session_with(engine.clone());
        session.load(sources(&["a.pdf", "b.pdf"])).unwrap();

        session.open_reference("b.pdf", 12).unwrap();
        assert_eq!(session.active().unwrap().name, "b.pdf");

        let watched = engine.clone();
        eventually(|| !watched.jumps().is_empty()).await;
        assert_eq!(engine.jumps(), vec![("b.pdf".to_string(), 12)]);

        assert!(matches!(
            session.open_reference("missing.pdf", 1),
            Err(ViewerError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn load_enforces_limits() {
        let engine = Arc::new(GatedEngine::default());
        let (mut session, _) = session_with(engine);

        assert_eq!(session.load(Vec::new()).unwrap_err(), ViewerError::EmptyInput);

        let names: Vec<String> = (0..11).map(|i| format!("{i}.pdf")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        assert_eq!(
            session.load(sources(&refs)).unwrap_err(),
            ViewerError::TooManyDocuments { max: 10, got: 11 }
        );
        assert_eq!(session.navigate(0).unwrap_err(), ViewerError::InvalidPage(0));
    }

    #[tokio::test]
    async fn dispose_releases_handles_and_stops_routing() {
        let engine = Arc::new(GatedEngine::default());
        let (mut session, allocator) = session_with(engine.clone());
        session.load(sources(&["a.pdf", "b.pdf"])).unwrap();
        session.renderer().wait_settled().await;
        assert_eq!(allocator.live_count(), 2);

        session.dispose();
        assert_eq!(allocator.live_count(), 0);
        assert_eq!(session.state(), SessionState::Disposed);
        assert_eq!(session.navigate(2).unwrap(), 0);

        let events = session.drain_events();
        assert!(events.contains(&SessionEvent::DocumentsReplaced { count: 2 }));
        assert!(session.drain_events().is_empty());
    }
}
