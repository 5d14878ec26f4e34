use std::num::NonZeroU32;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::ChannelPolicy;
use crate::error::{ViewerError, ViewerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationRequest {
    pub target_page: NonZeroU32,
}

impl NavigationRequest {
    pub fn new(page: u32) -> ViewerResult<Self> {
        NonZeroU32::new(page)
            .map(|target_page| Self { target_page })
            .ok_or(ViewerError::InvalidPage(page))
    }

    pub fn page(&self) -> u32 {
        self.target_page.get()
    }
}

type Handler = Arc<dyn Fn(NavigationRequest) + Send + Sync>;

struct ChannelInner {
    policy: ChannelPolicy,
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
    pending: Option<NavigationRequest>,
}

/// Fire-and-forget bus scoped to one viewing session.
///
/// `publish` invokes every handler registered at that moment, synchronously and
/// in registration order. With [`ChannelPolicy::Drop`] a request published while
/// nobody listens is lost; with [`ChannelPolicy::LatestForLateSubscriber`] the
/// latest such request is handed to the next subscriber.
#[derive(Clone)]
pub struct NavigationChannel {
    inner: Arc<Mutex<ChannelInner>>,
}

impl NavigationChannel {
    pub fn new(policy: ChannelPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelInner {
                policy,
                next_id: 0,
                handlers: Vec::new(),
                pending: None,
            })),
        }
    }

    /// Returns how many handlers received the request.
    pub fn publish(&self, request: NavigationRequest) -> usize {
        let handlers: Vec<Handler> = {
            let mut inner = self.inner.lock();
            if inner.handlers.is_empty() {
                match inner.policy {
                    ChannelPolicy::Drop => {
                        debug!(page = request.page(), "navigation request lost: no subscriber");
                    }
                    ChannelPolicy::LatestForLateSubscriber => {
                        debug!(page = request.page(), "navigation request held for next subscriber");
                        inner.pending = Some(request);
                    }
                }
                return 0;
            }
            inner.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        // Handlers run outside the lock so they may publish or unsubscribe.
        for handler in &handlers {
            handler(request);
        }
        trace!(page = request.page(), delivered = handlers.len(), "navigation request published");
        handlers.len()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(NavigationRequest) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let (id, held) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.handlers.push((id, Arc::clone(&handler)));
            (id, inner.pending.take())
        };
        if let Some(request) = held {
            handler(request);
        }
        Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn policy(&self) -> ChannelPolicy {
        self.inner.lock().policy
    }
}

/// Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    channel: Weak<Mutex<ChannelInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.lock().handlers.retain(|(id, _)| *id != self.id);
        }
    }
}
