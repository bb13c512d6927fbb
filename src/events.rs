use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, ErrorKind};
use crate::session::UserInfo;

/// Event categories a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SignedIn,
    SignedOut,
    Error,
}

/// State change published by the authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A session was established, or an existing one re-announced.
    SignedIn(UserInfo),
    SignedOut,
    Error { kind: ErrorKind, message: String },
}

impl AuthEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SignedIn(_) => EventKind::SignedIn,
            Self::SignedOut => EventKind::SignedOut,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

impl From<&Error> for AuthEvent {
    fn from(error: &Error) -> Self {
        Self::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

/// Ordered, synchronous observer list.
///
/// A panicking handler is logged and skipped; later handlers still run.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, EventKind, Handler)>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, kind, Arc::new(handler)));
        id
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sub, _, _)| *sub != id);
        handlers.len() != before
    }

    pub fn emit(&self, event: &AuthEvent) {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or call back into the authenticator.
        let targets: Vec<Handler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();

        for handler in targets {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(event = ?kind, "Auth event handler panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |name: &'static str| -> Handler {
            let log = Arc::clone(&log2);
            Arc::new(move |_: &AuthEvent| log.lock().push(name.to_string()))
        };
        (log, make)
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let first = make("first");
        let second = make("second");
        bus.on(EventKind::SignedOut, move |e| first(e));
        bus.on(EventKind::SignedOut, move |e| second(e));

        bus.emit(&AuthEvent::SignedOut);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn only_matching_kind_is_delivered() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let h = make("signed-in");
        bus.on(EventKind::SignedIn, move |e| h(e));

        bus.emit(&AuthEvent::SignedOut);
        assert!(log.lock().is_empty());
        bus.emit(&AuthEvent::SignedIn(UserInfo::default()));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let after = make("after");
        bus.on(EventKind::Error, |_| panic!("handler failure"));
        bus.on(EventKind::Error, move |e| after(e));

        bus.emit(&AuthEvent::from(&Error::NotSignedIn));
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn off_removes_subscription() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let h = make("gone");
        let id = bus.on(EventKind::SignedOut, move |e| h(e));

        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&AuthEvent::SignedOut);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn error_event_carries_kind_and_message() {
        let event = AuthEvent::from(&Error::StateMismatch);
        assert_eq!(event.kind(), EventKind::Error);
        let AuthEvent::Error { kind, message } = event else {
            panic!("expected error event");
        };
        assert_eq!(kind, ErrorKind::StateMismatch);
        assert!(message.contains("State mismatch"));
    }
}
