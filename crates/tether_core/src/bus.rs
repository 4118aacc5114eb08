#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::events::{Event, EventKind};

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous, in-process publish/subscribe hub.
///
/// `publish` runs every handler subscribed to the event's kind, in subscription order,
/// on the caller's task. A handler that fails or panics is logged and skipped; the
/// remaining handlers still run and the publisher never sees the failure.
#[derive(Clone, Default)]
pub struct EventBus {
	inner: Arc<RwLock<Registry>>,
}

#[derive(Default)]
struct Registry {
	next_id: u64,
	handlers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
	where
		F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		let mut reg = self.inner.write();
		reg.next_id += 1;
		let id = SubscriptionId(reg.next_id);
		reg.handlers.entry(kind).or_default().push((id, Arc::new(handler)));
		debug!(kind = kind.as_str(), subscription = id.0, "bus: subscribed");
		id
	}

	/// Remove a handler. Returns false if it was not subscribed.
	pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
		let mut reg = self.inner.write();
		let mut removed = false;
		reg.handlers.retain(|_, subs| {
			let before = subs.len();
			subs.retain(|(sid, _)| *sid != id);
			removed |= subs.len() != before;
			!subs.is_empty()
		});
		removed
	}

	pub fn publish(&self, event: Event) {
		let kind = event.kind();

		// Snapshot so handlers can publish or (un)subscribe re-entrantly.
		let handlers: Vec<(SubscriptionId, Handler)> = {
			let reg = self.inner.read();
			match reg.handlers.get(&kind) {
				Some(subs) => subs.clone(),
				None => return,
			}
		};

		for (id, handler) in handlers {
			match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					metrics::counter!("tether_bus_handler_errors_total").increment(1);
					warn!(kind = kind.as_str(), subscription = id.0, error = %format!("{e:#}"), "bus: handler failed");
				}
				Err(_) => {
					metrics::counter!("tether_bus_handler_panics_total").increment(1);
					warn!(kind = kind.as_str(), subscription = id.0, "bus: handler panicked");
				}
			}
		}
	}

	pub fn subscriber_count(&self, kind: EventKind) -> usize {
		self.inner.read().handlers.get(&kind).map_or(0, Vec::len)
	}

	/// Drop every subscription.
	pub fn clear(&self) {
		self.inner.write().handlers.clear();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use parking_lot::Mutex;

	use super::*;
	use crate::events::{SessionEvent, Toast};

	fn toast(msg: &str) -> Event {
		Event::Toast(Toast::success(msg))
	}

	#[test]
	fn dispatches_in_subscription_order() {
		let bus = EventBus::new();
		let seen = Arc::new(Mutex::new(Vec::new()));

		for n in 0..3 {
			let seen = seen.clone();
			bus.subscribe(EventKind::Toast, move |_| {
				seen.lock().push(n);
				Ok(())
			});
		}

		bus.publish(toast("hi"));
		assert_eq!(*seen.lock(), vec![0, 1, 2]);
	}

	#[test]
	fn failing_and_panicking_handlers_do_not_stop_dispatch() {
		let bus = EventBus::new();
		let calls = Arc::new(AtomicUsize::new(0));

		bus.subscribe(EventKind::Toast, |_| Err(anyhow::anyhow!("boom")));
		bus.subscribe(EventKind::Toast, |_| panic!("handler bug"));
		let c = calls.clone();
		bus.subscribe(EventKind::Toast, move |_| {
			c.fetch_add(1, Ordering::SeqCst);
			Ok(())
		});

		bus.publish(toast("one"));
		bus.publish(toast("two"));
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn only_matching_kind_is_delivered_and_unsubscribe_works() {
		let bus = EventBus::new();
		let calls = Arc::new(AtomicUsize::new(0));

		let c = calls.clone();
		let id = bus.subscribe(EventKind::Session, move |_| {
			c.fetch_add(1, Ordering::SeqCst);
			Ok(())
		});

		bus.publish(toast("ignored"));
		bus.publish(Event::Session(SessionEvent::LoggedOut));
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		assert!(bus.unsubscribe(id));
		assert!(!bus.unsubscribe(id));
		bus.publish(Event::Session(SessionEvent::LoggedOut));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(bus.subscriber_count(EventKind::Session), 0);
	}

	#[test]
	fn handlers_may_publish_reentrantly() {
		let bus = EventBus::new();
		let toasts = Arc::new(AtomicUsize::new(0));

		let inner_bus = bus.clone();
		bus.subscribe(EventKind::Session, move |_| {
			inner_bus.publish(toast("from handler"));
			Ok(())
		});
		let t = toasts.clone();
		bus.subscribe(EventKind::Toast, move |_| {
			t.fetch_add(1, Ordering::SeqCst);
			Ok(())
		});

		bus.publish(Event::Session(SessionEvent::AutoLoginRequested));
		assert_eq!(toasts.load(Ordering::SeqCst), 1);
	}
}
