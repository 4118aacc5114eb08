#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_domain::{FriendState, User};

use super::{Bucket, FriendSnapshot, Presence, PresenceConfig, UpdateOutcome, UserSource};
use crate::bus::EventBus;
use crate::events::{Event, EventKind, PresenceEvent};
use crate::feed::{FeedDetail, FeedEntry};

#[derive(Default)]
struct FakeSource {
	users: Mutex<HashMap<String, User>>,
	calls: AtomicUsize,
	fail: AtomicBool,
}

impl FakeSource {
	fn set(&self, user: User) {
		self.users.lock().insert(user.id.clone(), user);
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl UserSource for FakeSource {
	async fn fetch_user(&self, user_id: &str) -> anyhow::Result<User> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("connection reset");
		}
		self.users
			.lock()
			.get(user_id)
			.cloned()
			.ok_or_else(|| anyhow::anyhow!("no such user: {user_id}"))
	}
}

fn user(id: &str, name: &str, state: FriendState, location: &str) -> User {
	User {
		id: id.to_string(),
		display_name: name.to_string(),
		state: Some(state),
		location: Some(location.to_string()),
		..User::default()
	}
}

struct Harness {
	presence: Presence,
	source: Arc<FakeSource>,
	events: Arc<Mutex<Vec<PresenceEvent>>>,
}

impl Harness {
	fn feed(&self) -> Vec<FeedEntry> {
		self.events
			.lock()
			.iter()
			.filter_map(|e| match e {
				PresenceEvent::Feed(entry) => Some(entry.clone()),
				_ => None,
			})
			.collect()
	}
}

fn harness() -> Harness {
	let bus = EventBus::new();
	let source = Arc::new(FakeSource::default());
	let presence = Presence::new(bus.clone(), source.clone(), PresenceConfig::default());

	let events = Arc::new(Mutex::new(Vec::new()));
	let sink = events.clone();
	bus.subscribe(EventKind::Presence, move |ev| {
		if let Event::Presence(ev) = ev {
			sink.lock().push(ev.clone());
		}
		Ok(())
	});

	Harness {
		presence,
		source,
		events,
	}
}

fn online(ids: &[&str]) -> FriendSnapshot {
	FriendSnapshot {
		online: ids.iter().map(|s| s.to_string()).collect(),
		..FriendSnapshot::default()
	}
}

#[tokio::test(start_paused = true)]
async fn corrective_push_during_debounce_discards_downgrade() {
	let h = harness();
	h.presence.apply_friend_snapshot(&online(&["usr_a"]));
	h.source.set(user("usr_a", "Alice", FriendState::Offline, "offline"));

	let task = h
		.presence
		.spawn_update("usr_a", Some(FriendState::Offline))
		.expect("inside a runtime");

	tokio::time::sleep(Duration::from_secs(60)).await;
	assert!(h.presence.is_in_flight("usr_a"));
	h.presence.record_online_push("usr_a");

	assert_eq!(task.await.expect("join"), UpdateOutcome::Discarded);
	assert_eq!(h.presence.state_of("usr_a"), Some(FriendState::Online));
	assert!(!h.presence.is_in_flight("usr_a"));
	assert!(h.feed().is_empty());
	assert_eq!(h.source.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn uncorrected_downgrade_commits_one_offline_entry() {
	let h = harness();
	h.presence.apply_friend_snapshot(&online(&["usr_a"]));
	h.source.set(user("usr_a", "Alice", FriendState::Offline, "offline"));

	let outcome = h.presence.update_friend("usr_a", Some(FriendState::Offline)).await;
	assert_eq!(
		outcome,
		UpdateOutcome::Committed {
			from: FriendState::Online,
			to: FriendState::Offline,
		}
	);

	let feed = h.feed();
	assert_eq!(feed.len(), 1);
	assert_eq!(feed[0].display_name, "Alice");
	match &feed[0].detail {
		FeedDetail::Offline { online_for, .. } => {
			assert!(*online_for >= Duration::from_secs(170));
			assert!(*online_for < Duration::from_secs(171));
		}
		other => panic!("expected an offline entry, got {other:?}"),
	}
	assert_eq!(h.presence.bucket(Bucket::Offline), vec!["usr_a"]);
	assert_eq!(h.presence.recent_offline(), vec!["usr_a"]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_update_for_same_friend_is_ignored() {
	let h = harness();
	h.presence.apply_friend_snapshot(&online(&["usr_a"]));
	h.source.set(user("usr_a", "Alice", FriendState::Active, "private"));

	let first = h
		.presence
		.spawn_update("usr_a", Some(FriendState::Active))
		.expect("inside a runtime");
	tokio::task::yield_now().await;

	let second = h.presence.update_friend("usr_a", Some(FriendState::Offline)).await;
	assert_eq!(second, UpdateOutcome::Ignored);

	assert_eq!(
		first.await.expect("join"),
		UpdateOutcome::Committed {
			from: FriendState::Online,
			to: FriendState::Active,
		}
	);
	assert_eq!(h.source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_leaves_state_untouched() {
	let h = harness();
	h.presence.apply_friend_snapshot(&FriendSnapshot {
		active: vec!["usr_a".to_string()],
		..FriendSnapshot::default()
	});
	h.source.fail.store(true, Ordering::SeqCst);

	let outcome = h.presence.update_friend("usr_a", Some(FriendState::Offline)).await;
	assert_eq!(outcome, UpdateOutcome::Failed);
	assert_eq!(h.presence.state_of("usr_a"), Some(FriendState::Active));
	assert!(!h.presence.is_in_flight("usr_a"));
}

#[tokio::test(start_paused = true)]
async fn full_refresh_during_debounce_supersedes() {
	let h = harness();
	h.presence.apply_friend_snapshot(&online(&["usr_a"]));
	h.source.set(user("usr_a", "Alice", FriendState::Offline, "offline"));

	let task = h
		.presence
		.spawn_update("usr_a", Some(FriendState::Offline))
		.expect("inside a runtime");
	tokio::time::sleep(Duration::from_secs(10)).await;
	h.presence.apply_friend_snapshot(&online(&["usr_a"]));

	assert_eq!(task.await.expect("join"), UpdateOutcome::Superseded);
	assert_eq!(h.presence.state_of("usr_a"), Some(FriendState::Online));
	assert!(h.feed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_cancels_pending_debounce() {
	let h = harness();
	h.presence.apply_friend_snapshot(&online(&["usr_a"]));

	let task = h
		.presence
		.spawn_update("usr_a", Some(FriendState::Offline))
		.expect("inside a runtime");
	tokio::time::sleep(Duration::from_secs(1)).await;
	h.presence.reset();

	assert_eq!(task.await.expect("join"), UpdateOutcome::Cancelled);
	assert!(h.presence.is_empty());
	assert_eq!(h.source.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn snapshot_is_authoritative_and_removes_absent_friends() {
	let h = harness();
	h.presence.apply_friend_snapshot(&online(&["usr_a", "usr_b"]));
	assert!(h.events.lock().is_empty(), "first sighting is silent");

	tokio::time::sleep(Duration::from_secs(30)).await;
	h.presence.apply_friend_snapshot(&FriendSnapshot {
		offline: vec!["usr_a".to_string()],
		..FriendSnapshot::default()
	});

	assert_eq!(h.presence.state_of("usr_a"), Some(FriendState::Offline));
	assert!(!h.presence.is_friend("usr_b"));

	let events = h.events.lock().clone();
	assert!(events.iter().any(|e| matches!(
		e,
		PresenceEvent::FriendRemoved { user_id, .. } if user_id == "usr_b"
	)));
	let feed = h.feed();
	assert_eq!(feed.len(), 1);
	assert!(matches!(
		feed[0].detail,
		FeedDetail::Offline { online_for, .. }
			if online_for >= Duration::from_secs(30) && online_for < Duration::from_secs(31)
	));

	h.presence.apply_friend_snapshot(&FriendSnapshot::default());
	assert_eq!(h.presence.len(), 1, "empty snapshot is ignored");
}

#[tokio::test(start_paused = true)]
async fn same_state_refreshes_and_confirms_online() {
	let h = harness();
	h.presence.apply_friend_snapshot(&online(&["usr_a"]));
	h.source.set(user("usr_a", "Alice", FriendState::Online, "wrld_1:1"));

	assert_eq!(h.presence.update_friend("usr_a", None).await, UpdateOutcome::Refreshed);
	tokio::task::yield_now().await;
	assert_eq!(h.source.calls(), 0);

	assert_eq!(
		h.presence.update_friend("usr_a", Some(FriendState::Online)).await,
		UpdateOutcome::Refreshed
	);
	tokio::task::yield_now().await;
	assert_eq!(h.source.calls(), 1);

	assert_eq!(
		h.presence.update_friend("usr_z", Some(FriendState::Online)).await,
		UpdateOutcome::NotFriend
	);
}

#[test]
fn vip_friends_move_to_vip_bucket() {
	let h = harness();
	h.presence.apply_friend_snapshot(&online(&["usr_a", "usr_b"]));
	h.presence
		.set_vip_friends(&BTreeSet::from(["usr_a".to_string()]));

	assert_eq!(h.presence.bucket(Bucket::VipOnline), vec!["usr_a"]);
	assert_eq!(h.presence.bucket(Bucket::Online), vec!["usr_b"]);
	assert!(h.presence.friend("usr_a").is_some_and(|f| f.is_vip));
}

#[test]
fn location_changes_emit_gps_only_while_online() {
	let h = harness();
	h.presence.apply_friend_snapshot(&FriendSnapshot {
		online: vec!["usr_a".to_string()],
		offline: vec!["usr_b".to_string()],
		..FriendSnapshot::default()
	});

	h.presence.update_location("usr_a", "wrld_2:5", Some("Second".to_string()));
	h.presence.update_location("usr_a", "traveling", None);
	h.presence.update_location("usr_b", "wrld_3:1", None);

	let feed = h.feed();
	assert_eq!(feed.len(), 1);
	assert_eq!(
		feed[0].detail,
		FeedDetail::Gps {
			location: "wrld_2:5".to_string(),
			previous_location: String::new(),
			world_name: Some("Second".to_string()),
		}
	);
	assert_eq!(h.presence.friend("usr_a").map(|f| f.location).as_deref(), Some("traveling"));
}

#[test]
fn user_updates_rename_and_report_status() {
	let h = harness();
	let first = Arc::new(User {
		status: "active".to_string(),
		..user("usr_a", "Alice", FriendState::Online, "wrld_1:1")
	});
	assert!(h.presence.add_friend("usr_a", Some(first.clone())));
	assert!(!h.presence.add_friend("usr_a", None));
	assert_eq!(h.presence.state_of("usr_a"), Some(FriendState::Online));

	let second = Arc::new(User {
		display_name: "Alicia".to_string(),
		status: "busy".to_string(),
		..(*first).clone()
	});
	h.presence.on_user_updated(&second, Some(&first));

	let events = h.events.lock().clone();
	assert!(matches!(&events[0], PresenceEvent::FriendAdded { display_name, .. } if display_name == "Alice"));
	assert!(events.iter().any(|e| matches!(
		e,
		PresenceEvent::FriendRenamed { previous, display_name, .. } if previous == "Alice" && display_name == "Alicia"
	)));
	assert!(events.iter().any(|e| matches!(
		e,
		PresenceEvent::Feed(FeedEntry { detail: FeedDetail::Status { status, .. }, .. }) if status == "busy"
	)));

	assert!(h.presence.remove_friend("usr_a"));
	assert!(h.presence.bucket(Bucket::Online).is_empty());
}

#[test]
fn snapshot_from_current_user_treats_unlisted_friends_as_offline() {
	let current = tether_domain::CurrentUser {
		id: "usr_me".to_string(),
		friends: vec!["usr_a".to_string(), "usr_b".to_string(), "usr_c".to_string()],
		online_friends: vec!["usr_a".to_string()],
		active_friends: vec!["usr_b".to_string()],
		..tether_domain::CurrentUser::default()
	};
	let snapshot = FriendSnapshot::from_current_user(&current);
	assert_eq!(snapshot.offline, vec!["usr_c".to_string()]);
}

#[test]
fn memos_are_kept_for_friends() {
	let h = harness();
	h.presence
		.load_memos(HashMap::from([("usr_a".to_string(), "old".to_string())]));
	h.presence.apply_friend_snapshot(&online(&["usr_a"]));
	assert_eq!(h.presence.friend("usr_a").map(|f| f.memo).as_deref(), Some("old"));

	h.presence.set_memo("usr_a", "new");
	assert_eq!(h.presence.memo("usr_a").as_deref(), Some("new"));
	assert!(matches!(
		h.events.lock().last(),
		Some(PresenceEvent::MemoChanged { memo, .. }) if memo == "new"
	));
}
