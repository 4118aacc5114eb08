#![forbid(unsafe_code)]

//! Friend presence state machine.
//!
//! Three sources report presence: full REST refreshes ([`Presence::apply_friend_snapshot`]),
//! per-user fetches and pipeline pushes ([`Presence::update_friend`]). Downgrades from
//! online wait out a debounce window so that brief disconnects do not produce feed noise.

mod buckets;

#[cfg(test)]
mod tests;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tether_domain::{CurrentUser, FriendState, Location, User};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use buckets::Bucket;
use buckets::Buckets;

use crate::bus::EventBus;
use crate::events::{Event, PresenceEvent};
use crate::feed::{FeedDetail, FeedEntry};

#[derive(Debug, Clone)]
pub struct PresenceConfig {
	/// How long an online friend must stay away before the downgrade is committed.
	pub debounce: Duration,
}

impl Default for PresenceConfig {
	fn default() -> Self {
		Self {
			debounce: Duration::from_secs(170),
		}
	}
}

/// Per-user REST lookup used to confirm a transition.
#[async_trait]
pub trait UserSource: Send + Sync + 'static {
	async fn fetch_user(&self, user_id: &str) -> anyhow::Result<User>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
	/// A reconciliation for this friend is already running.
	Ignored,
	NotFriend,
	/// Same state; name, VIP flag and ordering were refreshed.
	Refreshed,
	/// An online push arrived during the debounce window.
	Discarded,
	/// The confirming fetch failed; state unchanged.
	Failed,
	/// Shut down while waiting.
	Cancelled,
	/// A full refresh landed while waiting.
	Superseded,
	Committed { from: FriendState, to: FriendState },
}

impl UpdateOutcome {
	pub const fn as_str(self) -> &'static str {
		match self {
			UpdateOutcome::Ignored => "ignored",
			UpdateOutcome::NotFriend => "not_friend",
			UpdateOutcome::Refreshed => "refreshed",
			UpdateOutcome::Discarded => "discarded",
			UpdateOutcome::Failed => "failed",
			UpdateOutcome::Cancelled => "cancelled",
			UpdateOutcome::Superseded => "superseded",
			UpdateOutcome::Committed { .. } => "committed",
		}
	}
}

/// Friend id lists from a full refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FriendSnapshot {
	pub online: Vec<String>,
	pub active: Vec<String>,
	pub offline: Vec<String>,
}

impl FriendSnapshot {
	/// Friends missing from every presence list count as offline.
	pub fn from_current_user(user: &CurrentUser) -> Self {
		let listed: HashSet<&str> = user
			.online_friends
			.iter()
			.chain(&user.active_friends)
			.chain(&user.offline_friends)
			.map(String::as_str)
			.collect();

		let mut offline = user.offline_friends.clone();
		offline.extend(user.friends.iter().filter(|id| !listed.contains(id.as_str())).cloned());

		Self {
			online: user.online_friends.clone(),
			active: user.active_friends.clone(),
			offline,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.online.is_empty() && self.active.is_empty() && self.offline.is_empty()
	}

	/// Each id once; online beats active beats offline.
	fn states(&self) -> Vec<(String, FriendState)> {
		let mut seen = HashSet::new();
		let mut out = Vec::new();
		let lists = [
			(&self.online, FriendState::Online),
			(&self.active, FriendState::Active),
			(&self.offline, FriendState::Offline),
		];
		for (ids, state) in lists {
			for id in ids {
				if !id.is_empty() && seen.insert(id.as_str()) {
					out.push((id.clone(), state));
				}
			}
		}
		out
	}
}

/// Read-only view of one friend.
#[derive(Debug, Clone)]
pub struct FriendView {
	pub id: String,
	pub display_name: String,
	pub state: FriendState,
	pub is_vip: bool,
	pub seq: u64,
	pub memo: String,
	pub location: String,
	pub online_since: Option<Instant>,
	pub offline_since: Option<Instant>,
	pub user: Option<Arc<User>>,
}

struct FriendContext {
	id: String,
	user: Option<Arc<User>>,
	name: String,
	is_vip: bool,
	state: FriendState,
	seq: u64,
	memo: String,
	location: String,
	online_since: Option<Instant>,
	offline_since: Option<Instant>,
}

impl FriendContext {
	fn display_name(&self) -> &str {
		if self.name.is_empty() { &self.id } else { &self.name }
	}

	fn bucket(&self) -> Bucket {
		Bucket::for_state(self.state, self.is_vip)
	}

	fn entry(&self, detail: FeedDetail) -> FeedEntry {
		FeedEntry {
			time: Utc::now(),
			user_id: self.id.clone(),
			display_name: self.display_name().to_string(),
			is_friend: true,
			is_vip: self.is_vip,
			detail,
		}
	}

	/// Move to `to`, returning the feed detail the change produces.
	fn transition(&mut self, to: FriendState, location: Option<&str>, now: Instant) -> Option<FeedDetail> {
		let from = self.state;
		let previous_location = self.location.clone();
		if let Some(location) = location {
			self.location = location.to_string();
		}
		if from == to {
			return None;
		}
		self.state = to;

		if from == FriendState::Online {
			let online_for = self
				.online_since
				.take()
				.map(|since| now.saturating_duration_since(since))
				.unwrap_or_default();
			self.offline_since = Some(now);
			Some(FeedDetail::Offline {
				location: previous_location,
				online_for,
			})
		} else if to == FriendState::Online {
			self.online_since = Some(now);
			self.offline_since = None;
			Some(FeedDetail::Online {
				location: self.location.clone(),
			})
		} else {
			if to == FriendState::Offline {
				self.offline_since = Some(now);
			}
			None
		}
	}

	fn view(&self) -> FriendView {
		FriendView {
			id: self.id.clone(),
			display_name: self.display_name().to_string(),
			state: self.state,
			is_vip: self.is_vip,
			seq: self.seq,
			memo: self.memo.clone(),
			location: self.location.clone(),
			online_since: self.online_since,
			offline_since: self.offline_since,
			user: self.user.clone(),
		}
	}
}

#[derive(Default)]
struct State {
	friends: HashMap<String, FriendContext>,
	buckets: Buckets,
	in_flight: HashSet<String>,
	last_online_push: HashMap<String, Instant>,
	vip: BTreeSet<String>,
	memos: HashMap<String, String>,
	next_seq: u64,
	/// Bumped by every full refresh.
	generation: u64,
}

impl State {
	fn create(&mut self, id: &str, state: FriendState, user: Option<Arc<User>>, now: Instant) -> &mut FriendContext {
		self.next_seq += 1;
		let ctx = FriendContext {
			id: id.to_string(),
			name: user.as_ref().map(|u| u.display_name.clone()).unwrap_or_default(),
			location: user.as_ref().and_then(|u| u.location.clone()).unwrap_or_default(),
			user,
			is_vip: self.vip.contains(id),
			state,
			seq: self.next_seq,
			memo: self.memos.get(id).cloned().unwrap_or_default(),
			online_since: (state == FriendState::Online).then_some(now),
			offline_since: (state == FriendState::Offline).then_some(now),
		};
		self.buckets.place(id, ctx.display_name(), ctx.bucket());
		self.friends.entry(id.to_string()).or_insert(ctx)
	}

	/// Re-read name and VIP flag, re-sorting if either moved.
	fn refresh_in_place(&mut self, id: &str) -> Option<PresenceEvent> {
		let is_vip = self.vip.contains(id);
		let ctx = self.friends.get_mut(id)?;

		let mut renamed = None;
		if let Some(user) = &ctx.user
			&& !user.display_name.is_empty()
			&& user.display_name != ctx.name
		{
			let previous = std::mem::replace(&mut ctx.name, user.display_name.clone());
			if !previous.is_empty() {
				renamed = Some(PresenceEvent::FriendRenamed {
					user_id: id.to_string(),
					previous,
					display_name: ctx.name.clone(),
				});
			}
		}
		ctx.is_vip = is_vip;

		let (name, bucket) = (ctx.display_name().to_string(), ctx.bucket());
		self.buckets.reposition(id, &name, bucket);
		renamed
	}
}

/// Removes the friend from the in-flight set on every exit path.
struct InFlightGuard {
	state: Arc<Mutex<State>>,
	id: String,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.state.lock().in_flight.remove(&self.id);
	}
}

#[derive(Clone)]
pub struct Presence {
	bus: EventBus,
	source: Arc<dyn UserSource>,
	config: PresenceConfig,
	state: Arc<Mutex<State>>,
	/// Bumped by `reset`; pending waits treat a change as cancellation.
	epoch: Arc<watch::Sender<u64>>,
}

impl Presence {
	pub fn new(bus: EventBus, source: Arc<dyn UserSource>, config: PresenceConfig) -> Self {
		let (epoch, _) = watch::channel(0);
		Self {
			bus,
			source,
			config,
			state: Arc::new(Mutex::new(State::default())),
			epoch: Arc::new(epoch),
		}
	}

	fn publish_all(&self, events: impl IntoIterator<Item = PresenceEvent>) {
		for ev in events {
			self.bus.publish(Event::Presence(ev));
		}
	}

	/// Reconcile one friend towards `requested` (or just refresh it when `None`).
	pub async fn update_friend(&self, user_id: &str, requested: Option<FriendState>) -> UpdateOutcome {
		let outcome = self.reconcile(user_id, requested).await;
		debug!(user = %user_id, ?requested, outcome = outcome.as_str(), "presence: update");
		if outcome == UpdateOutcome::Discarded {
			metrics::counter!("tether_presence_debounced_total").increment(1);
		}
		outcome
	}

	async fn reconcile(&self, user_id: &str, requested: Option<FriendState>) -> UpdateOutcome {
		let (current, generation, epoch) = {
			let mut st = self.state.lock();
			if st.in_flight.contains(user_id) {
				return UpdateOutcome::Ignored;
			}
			let Some(ctx) = st.friends.get(user_id) else {
				return UpdateOutcome::NotFriend;
			};
			let current = ctx.state;

			match requested {
				Some(to) if to != current => {
					st.in_flight.insert(user_id.to_string());
					(current, st.generation, *self.epoch.borrow())
				}
				_ => {
					let renamed = st.refresh_in_place(user_id);
					drop(st);
					self.publish_all(renamed);
					if requested == Some(FriendState::Online) {
						self.spawn_confirm_fetch(user_id);
					}
					return UpdateOutcome::Refreshed;
				}
			}
		};
		let guard = InFlightGuard {
			state: self.state.clone(),
			id: user_id.to_string(),
		};

		if current == FriendState::Online {
			let wait_start = Instant::now();
			let mut epoch_rx = self.epoch.subscribe();
			tokio::select! {
				_ = tokio::time::sleep(self.config.debounce) => {}
				_ = epoch_rx.wait_for(|e| *e != epoch) => return UpdateOutcome::Cancelled,
			}

			let pushed = {
				let st = self.state.lock();
				st.last_online_push.get(user_id).is_some_and(|at| *at > wait_start)
			};
			if pushed {
				return UpdateOutcome::Discarded;
			}
		}

		let user = match self.source.fetch_user(user_id).await {
			Ok(user) => user,
			Err(e) => {
				warn!(user = %user_id, error = %format!("{e:#}"), "presence: confirm fetch failed");
				return UpdateOutcome::Failed;
			}
		};
		if *self.epoch.borrow() != epoch {
			return UpdateOutcome::Cancelled;
		}

		let (outcome, events) = {
			let mut st = self.state.lock();
			if st.generation != generation {
				return UpdateOutcome::Superseded;
			}
			let is_vip = st.vip.contains(user_id);
			let Some(ctx) = st.friends.get_mut(user_id) else {
				return UpdateOutcome::NotFriend;
			};

			let to = user.presence();
			let location = user.location.clone();
			let user = Arc::new(user);
			if !user.display_name.is_empty() {
				ctx.name = user.display_name.clone();
			}
			ctx.user = Some(user);
			ctx.is_vip = is_vip;

			let from = ctx.state;
			let detail = ctx.transition(to, location.as_deref(), Instant::now());
			let mut events = Vec::new();
			if let Some(detail) = detail {
				events.push(PresenceEvent::Feed(ctx.entry(detail)));
			}
			let (name, bucket) = (ctx.display_name().to_string(), ctx.bucket());

			if from == to {
				st.buckets.reposition(user_id, &name, bucket);
				(UpdateOutcome::Refreshed, events)
			} else {
				st.buckets.place(user_id, &name, bucket);
				events.insert(
					0,
					PresenceEvent::StateChanged {
						user_id: user_id.to_string(),
						from,
						to,
					},
				);
				(UpdateOutcome::Committed { from, to }, events)
			}
		};

		drop(guard);
		self.publish_all(events);
		outcome
	}

	/// Run [`Presence::update_friend`] on the current runtime, if there is one.
	pub fn spawn_update(&self, user_id: &str, requested: Option<FriendState>) -> Option<JoinHandle<UpdateOutcome>> {
		let handle = tokio::runtime::Handle::try_current().ok()?;
		let this = self.clone();
		let user_id = user_id.to_string();
		Some(handle.spawn(async move { this.update_friend(&user_id, requested).await }))
	}

	/// Fire-and-forget fetch to confirm a freshly reported online state. The result flows
	/// back through the user cache.
	fn spawn_confirm_fetch(&self, user_id: &str) {
		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			return;
		};
		let source = self.source.clone();
		let user_id = user_id.to_string();
		handle.spawn(async move {
			if let Err(e) = source.fetch_user(&user_id).await {
				warn!(user = %user_id, error = %format!("{e:#}"), "presence: refresh fetch failed");
			}
		});
	}

	/// Authoritative full refresh. An empty snapshot is ignored.
	pub fn apply_friend_snapshot(&self, snapshot: &FriendSnapshot) {
		if snapshot.is_empty() {
			debug!("presence: empty friend snapshot ignored");
			return;
		}

		let now = Instant::now();
		let states = snapshot.states();
		let mut events = Vec::new();
		{
			let mut st = self.state.lock();
			st.generation += 1;

			let keep: HashSet<&str> = states.iter().map(|(id, _)| id.as_str()).collect();
			let gone: Vec<String> = st.friends.keys().filter(|id| !keep.contains(id.as_str())).cloned().collect();
			for id in gone {
				if let Some(ctx) = st.friends.remove(&id) {
					st.buckets.remove(&id);
					events.push(PresenceEvent::FriendRemoved {
						user_id: id,
						display_name: ctx.display_name().to_string(),
					});
				}
			}

			for (id, to) in &states {
				let Some(ctx) = st.friends.get_mut(id) else {
					st.create(id, *to, None, now);
					continue;
				};
				let from = ctx.state;
				let detail = ctx.transition(*to, None, now);
				if let Some(detail) = detail {
					events.push(PresenceEvent::Feed(ctx.entry(detail)));
				}
				if from != *to {
					let (name, bucket) = (ctx.display_name().to_string(), ctx.bucket());
					st.buckets.place(id, &name, bucket);
					events.push(PresenceEvent::StateChanged {
						user_id: id.clone(),
						from,
						to: *to,
					});
				}
			}
			info!(friends = st.friends.len(), "presence: friend snapshot applied");
		}
		self.publish_all(events);
	}

	/// New friendship. Returns false if `user_id` is already a friend.
	pub fn add_friend(&self, user_id: &str, user: Option<Arc<User>>) -> bool {
		let added = {
			let mut st = self.state.lock();
			if st.friends.contains_key(user_id) {
				return false;
			}
			let state = user.as_ref().map_or(FriendState::Offline, |u| u.presence());
			let ctx = st.create(user_id, state, user, Instant::now());
			PresenceEvent::FriendAdded {
				user_id: user_id.to_string(),
				display_name: ctx.display_name().to_string(),
			}
		};
		self.publish_all([added]);
		true
	}

	pub fn remove_friend(&self, user_id: &str) -> bool {
		let removed = {
			let mut st = self.state.lock();
			let Some(ctx) = st.friends.remove(user_id) else {
				return false;
			};
			st.buckets.remove(user_id);
			st.last_online_push.remove(user_id);
			PresenceEvent::FriendRemoved {
				user_id: user_id.to_string(),
				display_name: ctx.display_name().to_string(),
			}
		};
		self.publish_all([removed]);
		true
	}

	/// An unambiguous "is online" push; cancels a pending downgrade.
	pub fn record_online_push(&self, user_id: &str) {
		self.state.lock().last_online_push.insert(user_id.to_string(), Instant::now());
	}

	/// Refresh a friend from a newer user record; emits a status feed entry when the
	/// status changed.
	pub fn on_user_updated(&self, user: &Arc<User>, previous: Option<&User>) {
		let mut events = Vec::new();
		{
			let mut st = self.state.lock();
			let Some(ctx) = st.friends.get_mut(&user.id) else {
				return;
			};
			ctx.user = Some(user.clone());

			if let Some(previous) = previous
				&& (previous.status != user.status || previous.status_description != user.status_description)
			{
				events.push(PresenceEvent::Feed(ctx.entry(FeedDetail::Status {
					status: user.status.clone(),
					description: user.status_description.clone(),
					previous_status: previous.status.clone(),
				})));
			}
			events.extend(st.refresh_in_place(&user.id));
		}
		self.publish_all(events);
	}

	/// Location change for a friend; emits a GPS entry when an online friend lands in a
	/// new instance.
	pub fn update_location(&self, user_id: &str, location: &str, world_name: Option<String>) {
		let event = {
			let mut st = self.state.lock();
			let Some(ctx) = st.friends.get_mut(user_id) else {
				return;
			};
			if ctx.location == location {
				return;
			}
			let previous = std::mem::replace(&mut ctx.location, location.to_string());

			let parsed = Location::parse(location);
			if ctx.state != FriendState::Online || parsed.is_offline || parsed.is_traveling {
				return;
			}
			PresenceEvent::Feed(ctx.entry(FeedDetail::Gps {
				location: location.to_string(),
				previous_location: previous,
				world_name,
			}))
		};
		self.publish_all([event]);
	}

	/// Replace the VIP set (favorited friends), re-sorting affected friends.
	pub fn set_vip_friends(&self, ids: &BTreeSet<String>) {
		let mut st = self.state.lock();
		st.vip = ids.clone();
		let changed: Vec<(String, String, Bucket)> = st
			.friends
			.values_mut()
			.filter_map(|ctx| {
				let is_vip = ids.contains(&ctx.id);
				if ctx.is_vip == is_vip {
					return None;
				}
				ctx.is_vip = is_vip;
				Some((ctx.id.clone(), ctx.display_name().to_string(), ctx.bucket()))
			})
			.collect();
		for (id, name, bucket) in changed {
			st.buckets.reposition(&id, &name, bucket);
		}
	}

	/// Seed memos loaded from the store.
	pub fn load_memos(&self, memos: HashMap<String, String>) {
		let mut st = self.state.lock();
		for (id, memo) in &memos {
			if let Some(ctx) = st.friends.get_mut(id) {
				ctx.memo = memo.clone();
			}
		}
		st.memos = memos;
	}

	pub fn set_memo(&self, user_id: &str, memo: &str) {
		{
			let mut st = self.state.lock();
			if memo.is_empty() {
				st.memos.remove(user_id);
			} else {
				st.memos.insert(user_id.to_string(), memo.to_string());
			}
			if let Some(ctx) = st.friends.get_mut(user_id) {
				ctx.memo = memo.to_string();
			}
		}
		self.publish_all([PresenceEvent::MemoChanged {
			user_id: user_id.to_string(),
			memo: memo.to_string(),
		}]);
	}

	pub fn memo(&self, user_id: &str) -> Option<String> {
		self.state.lock().memos.get(user_id).cloned()
	}

	pub fn state_of(&self, user_id: &str) -> Option<FriendState> {
		self.state.lock().friends.get(user_id).map(|c| c.state)
	}

	pub fn friend(&self, user_id: &str) -> Option<FriendView> {
		self.state.lock().friends.get(user_id).map(FriendContext::view)
	}

	pub fn is_friend(&self, user_id: &str) -> bool {
		self.state.lock().friends.contains_key(user_id)
	}

	pub fn is_in_flight(&self, user_id: &str) -> bool {
		self.state.lock().in_flight.contains(user_id)
	}

	pub fn bucket(&self, bucket: Bucket) -> Vec<String> {
		self.state.lock().buckets.ids(bucket)
	}

	pub fn bucket_of(&self, user_id: &str) -> Option<Bucket> {
		self.state.lock().buckets.bucket_of(user_id)
	}

	pub fn recent_online(&self) -> Vec<String> {
		self.state.lock().buckets.recent_online()
	}

	pub fn recent_offline(&self) -> Vec<String> {
		self.state.lock().buckets.recent_offline()
	}

	pub fn len(&self) -> usize {
		self.state.lock().friends.len()
	}

	pub fn is_empty(&self) -> bool {
		self.state.lock().friends.is_empty()
	}

	/// Logout: cancel pending waits and forget every friend.
	pub fn reset(&self) {
		self.epoch.send_modify(|e| *e += 1);
		let mut st = self.state.lock();
		st.friends.clear();
		st.buckets.clear();
		st.last_online_push.clear();
		st.vip.clear();
		st.memos.clear();
		st.generation += 1;
	}
}
