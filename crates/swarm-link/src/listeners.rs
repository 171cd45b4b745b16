use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use swarm_core::{Envelope, EnvelopeKind};
use tracing::warn;

pub type ListenerFn = dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every non-control envelope.
    Message,
    Kind(EnvelopeKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

struct Entry {
    id: ListenerId,
    topic: Topic,
    handler: Arc<ListenerFn>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Publish/subscribe registry keyed by [`Topic`].
///
/// Handlers are invoked outside the registry lock, so a handler may register or
/// remove listeners; such changes apply from the next dispatch on.
#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<Inner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> ListenerId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.entries.push(Entry {
            id,
            topic,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.id != id);
        inner.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generic `Message` listeners first, then listeners for the envelope's kind,
    /// each in registration order.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        let (generic, specific) = {
            let inner = self.lock();
            let generic = inner
                .entries
                .iter()
                .filter(|entry| entry.topic == Topic::Message)
                .map(|entry| (entry.id, entry.handler.clone()))
                .collect::<Vec<_>>();
            let specific = inner
                .entries
                .iter()
                .filter(|entry| entry.topic == Topic::Kind(envelope.kind))
                .map(|entry| (entry.id, entry.handler.clone()))
                .collect::<Vec<_>>();
            (generic, specific)
        };

        let mut report = DispatchReport::default();
        for (id, handler) in generic.into_iter().chain(specific) {
            match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        "listener_error: id={} kind={} err={err:#}",
                        id.0,
                        envelope.kind.as_str()
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        "listener_panic: id={} kind={}",
                        id.0,
                        envelope.kind.as_str()
                    );
                }
            }
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking handler never holds this lock, but recover anyway.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn envelope(kind: EnvelopeKind) -> Envelope {
        Envelope::new(kind)
    }

    #[test]
    fn generic_listeners_run_before_kind_listeners_in_registration_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let log = seen.clone();
        registry.on(Topic::Kind(EnvelopeKind::Chat), move |_| {
            log.lock().expect("lock").push("chat-a");
            Ok(())
        });
        let log = seen.clone();
        registry.on(Topic::Message, move |_| {
            log.lock().expect("lock").push("message-a");
            Ok(())
        });
        let log = seen.clone();
        registry.on(Topic::Kind(EnvelopeKind::Thought), move |_| {
            log.lock().expect("lock").push("thought");
            Ok(())
        });
        let log = seen.clone();
        registry.on(Topic::Message, move |_| {
            log.lock().expect("lock").push("message-b");
            Ok(())
        });

        let report = registry.dispatch(&envelope(EnvelopeKind::Chat));
        assert_eq!(report.delivered, 3);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["message-a", "message-b", "chat-a"]
        );
    }

    #[test]
    fn failing_and_panicking_listeners_do_not_stop_dispatch() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(StdMutex::new(0usize));

        registry.on(Topic::Message, |_| anyhow::bail!("render failed"));
        registry.on(Topic::Message, |_| panic!("listener blew up"));
        let counter = hits.clone();
        registry.on(Topic::Message, move |_| {
            *counter.lock().expect("lock") += 1;
            Ok(())
        });

        let first = registry.dispatch(&envelope(EnvelopeKind::Chat));
        let second = registry.dispatch(&envelope(EnvelopeKind::Chat));
        assert_eq!(first, DispatchReport { delivered: 1, failed: 2 });
        assert_eq!(second, first);
        assert_eq!(*hits.lock().expect("lock"), 2);
    }

    #[test]
    fn off_removes_only_that_listener() {
        let registry = ListenerRegistry::new();
        let a = registry.on(Topic::Message, |_| Ok(()));
        let b = registry.on(Topic::Message, |_| Ok(()));
        assert_ne!(a, b);
        assert!(registry.off(a));
        assert!(!registry.off(a));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.dispatch(&envelope(EnvelopeKind::Debate)).delivered, 1);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot: Arc<StdMutex<Option<ListenerId>>> = Arc::new(StdMutex::new(None));
        let reg = registry.clone();
        let own = slot.clone();
        let id = registry.on(Topic::Message, move |_| {
            if let Some(id) = own.lock().expect("lock").take() {
                reg.off(id);
            }
            Ok(())
        });
        *slot.lock().expect("lock") = Some(id);

        assert_eq!(registry.dispatch(&envelope(EnvelopeKind::Chat)).delivered, 1);
        assert_eq!(registry.dispatch(&envelope(EnvelopeKind::Chat)).delivered, 0);
    }
}
