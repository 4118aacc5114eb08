#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::bus::{EventBus, SubscriptionId};
use crate::events::{Event, EventKind, PresenceEvent};
use crate::feed::{FeedDetail, FeedEntry, FriendLogKind};

/// A friend currently on the list, as last recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendLogCurrent {
	pub user_id: String,
	pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendLogHistory {
	pub time: DateTime<Utc>,
	pub user_id: String,
	pub display_name: String,
	pub kind: FriendLogKind,
}

/// Persistence collaborator for feed tables, the friend log and memos.
pub trait FeedStore: Send + Sync + 'static {
	/// Online, offline and status entries.
	fn add_feed_entry(&self, entry: &FeedEntry) -> anyhow::Result<()>;

	fn add_gps(&self, entry: &FeedEntry) -> anyhow::Result<()>;

	fn set_friend_log_current(&self, current: FriendLogCurrent) -> anyhow::Result<()>;

	fn delete_friend_log_current(&self, user_id: &str) -> anyhow::Result<()>;

	fn add_friend_log_history(&self, entry: FriendLogHistory) -> anyhow::Result<()>;

	fn friend_log_current(&self) -> anyhow::Result<Vec<FriendLogCurrent>>;

	fn memo(&self, user_id: &str) -> anyhow::Result<Option<String>>;

	fn memos(&self) -> anyhow::Result<HashMap<String, String>>;

	/// An empty memo deletes it.
	fn set_memo(&self, user_id: &str, memo: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Tables {
	feed: Vec<FeedEntry>,
	gps: Vec<FeedEntry>,
	friend_log_current: BTreeMap<String, FriendLogCurrent>,
	friend_log_history: Vec<FriendLogHistory>,
	memos: HashMap<String, String>,
}

/// In-memory [`FeedStore`].
#[derive(Default, Clone)]
pub struct MemoryStore {
	tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn feed_entries(&self) -> Vec<FeedEntry> {
		self.tables.lock().feed.clone()
	}

	pub fn gps_entries(&self) -> Vec<FeedEntry> {
		self.tables.lock().gps.clone()
	}

	pub fn friend_log_history(&self) -> Vec<FriendLogHistory> {
		self.tables.lock().friend_log_history.clone()
	}
}

impl FeedStore for MemoryStore {
	fn add_feed_entry(&self, entry: &FeedEntry) -> anyhow::Result<()> {
		self.tables.lock().feed.push(entry.clone());
		Ok(())
	}

	fn add_gps(&self, entry: &FeedEntry) -> anyhow::Result<()> {
		self.tables.lock().gps.push(entry.clone());
		Ok(())
	}

	fn set_friend_log_current(&self, current: FriendLogCurrent) -> anyhow::Result<()> {
		self.tables
			.lock()
			.friend_log_current
			.insert(current.user_id.clone(), current);
		Ok(())
	}

	fn delete_friend_log_current(&self, user_id: &str) -> anyhow::Result<()> {
		self.tables.lock().friend_log_current.remove(user_id);
		Ok(())
	}

	fn add_friend_log_history(&self, entry: FriendLogHistory) -> anyhow::Result<()> {
		self.tables.lock().friend_log_history.push(entry);
		Ok(())
	}

	fn friend_log_current(&self) -> anyhow::Result<Vec<FriendLogCurrent>> {
		Ok(self.tables.lock().friend_log_current.values().cloned().collect())
	}

	fn memo(&self, user_id: &str) -> anyhow::Result<Option<String>> {
		Ok(self.tables.lock().memos.get(user_id).cloned())
	}

	fn memos(&self) -> anyhow::Result<HashMap<String, String>> {
		Ok(self.tables.lock().memos.clone())
	}

	fn set_memo(&self, user_id: &str, memo: &str) -> anyhow::Result<()> {
		let mut tables = self.tables.lock();
		if memo.is_empty() {
			tables.memos.remove(user_id);
		} else {
			tables.memos.insert(user_id.to_string(), memo.to_string());
		}
		Ok(())
	}
}

/// Persist presence output: feed entries, friend-log changes and memos.
pub fn install_persistence(bus: &EventBus, store: Arc<dyn FeedStore>) -> SubscriptionId {
	bus.subscribe(EventKind::Presence, move |ev| {
		let Event::Presence(ev) = ev else {
			return Ok(());
		};
		persist(store.as_ref(), ev)
	})
}

fn persist(store: &dyn FeedStore, ev: &PresenceEvent) -> anyhow::Result<()> {
	let history = |user_id: &str, display_name: &str, kind| FriendLogHistory {
		time: Utc::now(),
		user_id: user_id.to_string(),
		display_name: display_name.to_string(),
		kind,
	};
	let current = |user_id: &str, display_name: &str| FriendLogCurrent {
		user_id: user_id.to_string(),
		display_name: display_name.to_string(),
	};

	match ev {
		PresenceEvent::Feed(entry) => match entry.detail {
			FeedDetail::Gps { .. } => store.add_gps(entry),
			FeedDetail::Online { .. } | FeedDetail::Offline { .. } | FeedDetail::Status { .. } => {
				store.add_feed_entry(entry)
			}
			_ => Ok(()),
		},
		PresenceEvent::FriendAdded { user_id, display_name } => {
			store.set_friend_log_current(current(user_id, display_name))?;
			store.add_friend_log_history(history(user_id, display_name, FriendLogKind::Added))
		}
		PresenceEvent::FriendRemoved { user_id, display_name } => {
			store.delete_friend_log_current(user_id)?;
			store.add_friend_log_history(history(user_id, display_name, FriendLogKind::Removed))
		}
		PresenceEvent::FriendRenamed {
			user_id,
			previous,
			display_name,
		} => {
			store.set_friend_log_current(current(user_id, display_name))?;
			store.add_friend_log_history(history(
				user_id,
				display_name,
				FriendLogKind::Renamed {
					previous: previous.clone(),
				},
			))
		}
		PresenceEvent::MemoChanged { user_id, memo } => store.set_memo(user_id, memo),
		PresenceEvent::StateChanged { .. } => Ok(()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn friend_log_follows_presence_events() {
		let bus = EventBus::new();
		let store = MemoryStore::new();
		install_persistence(&bus, Arc::new(store.clone()));

		bus.publish(Event::Presence(PresenceEvent::FriendAdded {
			user_id: "usr_a".to_string(),
			display_name: "Alice".to_string(),
		}));
		bus.publish(Event::Presence(PresenceEvent::FriendRenamed {
			user_id: "usr_a".to_string(),
			previous: "Alice".to_string(),
			display_name: "Alicia".to_string(),
		}));

		let current = store.friend_log_current().expect("current");
		assert_eq!(current.len(), 1);
		assert_eq!(current[0].display_name, "Alicia");

		bus.publish(Event::Presence(PresenceEvent::FriendRemoved {
			user_id: "usr_a".to_string(),
			display_name: "Alicia".to_string(),
		}));
		assert!(store.friend_log_current().expect("current").is_empty());

		let kinds: Vec<FriendLogKind> = store.friend_log_history().into_iter().map(|h| h.kind).collect();
		assert_eq!(
			kinds,
			vec![
				FriendLogKind::Added,
				FriendLogKind::Renamed {
					previous: "Alice".to_string()
				},
				FriendLogKind::Removed,
			]
		);
	}

	#[test]
	fn empty_memo_deletes() {
		let store = MemoryStore::new();
		store.set_memo("usr_a", "met at the meetup").expect("set");
		assert_eq!(store.memo("usr_a").expect("memo").as_deref(), Some("met at the meetup"));
		store.set_memo("usr_a", "").expect("set");
		assert!(store.memos().expect("memos").is_empty());
	}
}
