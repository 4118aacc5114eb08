#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, SubscriptionId};
use crate::events::{EntityEvent, Event, EventKind, PresenceEvent};

/// One item of the presence/notification feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
	pub time: DateTime<Utc>,
	pub user_id: String,
	pub display_name: String,
	pub is_friend: bool,
	pub is_vip: bool,
	pub detail: FeedDetail,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedDetail {
	Online {
		location: String,
	},
	Offline {
		location: String,
		online_for: Duration,
	},
	/// Location change while online.
	Gps {
		location: String,
		previous_location: String,
		world_name: Option<String>,
	},
	Status {
		status: String,
		description: String,
		previous_status: String,
	},
	FriendLog(FriendLogKind),
	Notification {
		kind: String,
		message: String,
	},
	/// Supplied by the game-log collaborator.
	GameLog {
		event: String,
		location: String,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FriendLogKind {
	Added,
	Removed,
	Renamed { previous: String },
}

/// Filterable category of a [`FeedEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
	Online,
	Offline,
	Gps,
	Status,
	FriendLog,
	Notification,
	GameLog,
}

impl FeedKind {
	pub const ALL: [FeedKind; 7] = [
		FeedKind::Online,
		FeedKind::Offline,
		FeedKind::Gps,
		FeedKind::Status,
		FeedKind::FriendLog,
		FeedKind::Notification,
		FeedKind::GameLog,
	];
}

/// Time-ordered input stream of the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedSource {
	GameLog,
	Presence,
	Notification,
	FriendLog,
}

impl FeedSource {
	const fn index(self) -> usize {
		match self {
			FeedSource::GameLog => 0,
			FeedSource::Presence => 1,
			FeedSource::Notification => 2,
			FeedSource::FriendLog => 3,
		}
	}
}

impl FeedEntry {
	pub fn kind(&self) -> FeedKind {
		match self.detail {
			FeedDetail::Online { .. } => FeedKind::Online,
			FeedDetail::Offline { .. } => FeedKind::Offline,
			FeedDetail::Gps { .. } => FeedKind::Gps,
			FeedDetail::Status { .. } => FeedKind::Status,
			FeedDetail::FriendLog(_) => FeedKind::FriendLog,
			FeedDetail::Notification { .. } => FeedKind::Notification,
			FeedDetail::GameLog { .. } => FeedKind::GameLog,
		}
	}

	pub fn source(&self) -> FeedSource {
		match self.kind() {
			FeedKind::Online | FeedKind::Offline | FeedKind::Gps | FeedKind::Status => FeedSource::Presence,
			FeedKind::FriendLog => FeedSource::FriendLog,
			FeedKind::Notification => FeedSource::Notification,
			FeedKind::GameLog => FeedSource::GameLog,
		}
	}
}

/// Audience an entry must belong to for a filter to let it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterLevel {
	Off,
	#[default]
	Everyone,
	Friends,
	Vip,
}

impl FilterLevel {
	pub fn admits(self, entry: &FeedEntry) -> bool {
		match self {
			FilterLevel::Off => false,
			FilterLevel::Everyone => true,
			FilterLevel::Friends => entry.is_friend,
			FilterLevel::Vip => entry.is_vip,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedFilters {
	levels: HashMap<FeedKind, FilterLevel>,
	fallback: FilterLevel,
}

impl FeedFilters {
	pub fn uniform(level: FilterLevel) -> Self {
		Self {
			levels: HashMap::new(),
			fallback: level,
		}
	}

	pub fn with(mut self, kind: FeedKind, level: FilterLevel) -> Self {
		self.levels.insert(kind, level);
		self
	}

	pub fn set(&mut self, kind: FeedKind, level: FilterLevel) {
		self.levels.insert(kind, level);
	}

	pub fn level(&self, kind: FeedKind) -> FilterLevel {
		self.levels.get(&kind).copied().unwrap_or(self.fallback)
	}

	pub fn admits(&self, entry: &FeedEntry) -> bool {
		self.level(entry.kind()).admits(entry)
	}
}

/// Which notification channels are switched on at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyChannels {
	pub overlay: bool,
	pub tts: bool,
	pub desktop: bool,
}

impl Default for NotifyChannels {
	fn default() -> Self {
		Self {
			overlay: true,
			tts: false,
			desktop: false,
		}
	}
}

/// How an entry should be surfaced; handed to the rendering collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchDecision {
	pub overlay: bool,
	pub tts: bool,
	pub desktop: bool,
}

impl DispatchDecision {
	pub fn is_silent(&self) -> bool {
		!(self.overlay || self.tts || self.desktop)
	}
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
	pub wrist_cap: usize,
	/// Per-source ring capacity.
	pub source_capacity: usize,
	pub wrist_filters: FeedFilters,
	pub notify_filters: FeedFilters,
	pub channels: NotifyChannels,
}

impl Default for FeedConfig {
	fn default() -> Self {
		Self {
			wrist_cap: 25,
			source_capacity: 200,
			wrist_filters: FeedFilters::uniform(FilterLevel::Everyone),
			notify_filters: FeedFilters::uniform(FilterLevel::Off)
				.with(FeedKind::Online, FilterLevel::Vip)
				.with(FeedKind::Offline, FilterLevel::Vip)
				.with(FeedKind::FriendLog, FilterLevel::Friends)
				.with(FeedKind::Notification, FilterLevel::Everyone),
			channels: NotifyChannels::default(),
		}
	}
}

/// Merges the four feed sources into the capped, filtered wrist feed.
#[derive(Clone)]
pub struct FeedCompositor {
	config: Arc<FeedConfig>,
	sources: Arc<Mutex<[VecDeque<FeedEntry>; 4]>>,
}

impl FeedCompositor {
	pub fn new(config: FeedConfig) -> Self {
		Self {
			config: Arc::new(config),
			sources: Arc::new(Mutex::new(Default::default())),
		}
	}

	pub fn config(&self) -> &FeedConfig {
		&self.config
	}

	/// Insert an entry into its source ring, keeping the ring oldest-first.
	pub fn push(&self, entry: FeedEntry) {
		let mut sources = self.sources.lock();
		let ring = &mut sources[entry.source().index()];

		let at = ring.iter().rposition(|e| e.time <= entry.time).map_or(0, |i| i + 1);
		ring.insert(at, entry);
		while ring.len() > self.config.source_capacity.max(1) {
			ring.pop_front();
		}
	}

	/// Newest-first merge of all sources, wrist-filtered and capped.
	pub fn compose(&self) -> Vec<FeedEntry> {
		let sources = self.sources.lock();
		let cap = self.config.wrist_cap;
		let mut cursors: Vec<usize> = sources.iter().map(VecDeque::len).collect();
		let mut out = Vec::with_capacity(cap.min(64));

		while out.len() < cap {
			let mut best: Option<(usize, &FeedEntry)> = None;
			for (src, ring) in sources.iter().enumerate() {
				let Some(pos) = cursors[src].checked_sub(1) else {
					continue;
				};
				let candidate = &ring[pos];
				if best.is_none_or(|(_, b)| candidate.time > b.time) {
					best = Some((src, candidate));
				}
			}

			let Some((src, entry)) = best else {
				break;
			};
			cursors[src] -= 1;
			if self.config.wrist_filters.admits(entry) {
				out.push(entry.clone());
			}
		}

		out
	}

	pub fn dispatch_decision(&self, entry: &FeedEntry) -> DispatchDecision {
		if !self.config.notify_filters.admits(entry) {
			return DispatchDecision::default();
		}
		let channels = self.config.channels;
		DispatchDecision {
			overlay: channels.overlay,
			tts: channels.tts,
			desktop: channels.desktop,
		}
	}

	pub fn len(&self, source: FeedSource) -> usize {
		self.sources.lock()[source.index()].len()
	}

	pub fn clear(&self) {
		for ring in self.sources.lock().iter_mut() {
			ring.clear();
		}
	}

	/// Feed presence, friend-log and notification events from the bus into the rings.
	pub fn install(&self, bus: &EventBus) -> Vec<SubscriptionId> {
		let presence = {
			let this = self.clone();
			bus.subscribe(EventKind::Presence, move |ev| {
				if let Event::Presence(ev) = ev
					&& let Some(entry) = presence_entry(ev)
				{
					this.push(entry);
				}
				Ok(())
			})
		};

		let notifications = {
			let this = self.clone();
			bus.subscribe(EventKind::Notification, move |ev| {
				if let Event::Notification(EntityEvent::Created(n)) = ev {
					this.push(FeedEntry {
						time: Utc::now(),
						user_id: n.sender_user_id.clone(),
						display_name: n.sender_username.clone(),
						is_friend: false,
						is_vip: false,
						detail: FeedDetail::Notification {
							kind: n.kind.clone(),
							message: n.message.clone(),
						},
					});
				}
				Ok(())
			})
		};

		vec![presence, notifications]
	}
}

fn presence_entry(ev: &PresenceEvent) -> Option<FeedEntry> {
	let (user_id, display_name, kind) = match ev {
		PresenceEvent::Feed(entry) => return Some(entry.clone()),
		PresenceEvent::FriendAdded { user_id, display_name } => (user_id, display_name, FriendLogKind::Added),
		PresenceEvent::FriendRemoved { user_id, display_name } => (user_id, display_name, FriendLogKind::Removed),
		PresenceEvent::FriendRenamed {
			user_id,
			previous,
			display_name,
		} => (
			user_id,
			display_name,
			FriendLogKind::Renamed {
				previous: previous.clone(),
			},
		),
		PresenceEvent::StateChanged { .. } | PresenceEvent::MemoChanged { .. } => return None,
	};

	Some(FeedEntry {
		time: Utc::now(),
		user_id: user_id.clone(),
		display_name: display_name.clone(),
		is_friend: true,
		is_vip: false,
		detail: FeedDetail::FriendLog(kind),
	})
}
