#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tether_domain::{
	Avatar, Favorite, FavoriteGroup, FriendState, Notification, Patch, PlayerModeration, User, World,
};

use crate::favorites::{FavoriteSlot, SlotBindings};
use crate::feed::FeedEntry;

/// Everything that travels over the [`EventBus`](crate::bus::EventBus).
#[derive(Debug, Clone)]
pub enum Event {
	User(EntityEvent<User>),
	World(EntityEvent<World>),
	Avatar(EntityEvent<Avatar>),
	Favorite(EntityEvent<Favorite>),
	FavoriteGroup(EntityEvent<FavoriteGroup>),
	Notification(EntityEvent<Notification>),
	PlayerModeration(EntityEvent<PlayerModeration>),

	/// A REST call completed for one logical resource.
	Rest(RestEvent),

	/// A decoded push message or a pipeline connection change.
	Pipeline(PipelineEvent),

	Presence(PresenceEvent),

	FavoriteGroups(FavoriteGroupEvent),

	Session(SessionEvent),

	/// Transient user-visible message.
	Toast(Toast),
}

/// Subscription key: one per [`Event`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	User,
	World,
	Avatar,
	Favorite,
	FavoriteGroup,
	Notification,
	PlayerModeration,
	Rest,
	Pipeline,
	Presence,
	FavoriteGroups,
	Session,
	Toast,
}

impl EventKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::User => "user",
			EventKind::World => "world",
			EventKind::Avatar => "avatar",
			EventKind::Favorite => "favorite",
			EventKind::FavoriteGroup => "favorite_group",
			EventKind::Notification => "notification",
			EventKind::PlayerModeration => "player_moderation",
			EventKind::Rest => "rest",
			EventKind::Pipeline => "pipeline",
			EventKind::Presence => "presence",
			EventKind::FavoriteGroups => "favorite_groups",
			EventKind::Session => "session",
			EventKind::Toast => "toast",
		}
	}
}

impl Event {
	pub fn kind(&self) -> EventKind {
		match self {
			Event::User(_) => EventKind::User,
			Event::World(_) => EventKind::World,
			Event::Avatar(_) => EventKind::Avatar,
			Event::Favorite(_) => EventKind::Favorite,
			Event::FavoriteGroup(_) => EventKind::FavoriteGroup,
			Event::Notification(_) => EventKind::Notification,
			Event::PlayerModeration(_) => EventKind::PlayerModeration,
			Event::Rest(_) => EventKind::Rest,
			Event::Pipeline(_) => EventKind::Pipeline,
			Event::Presence(_) => EventKind::Presence,
			Event::FavoriteGroups(_) => EventKind::FavoriteGroups,
			Event::Session(_) => EventKind::Session,
			Event::Toast(_) => EventKind::Toast,
		}
	}
}

/// Cache lifecycle of one record.
#[derive(Debug, Clone)]
pub enum EntityEvent<T> {
	Created(Arc<T>),
	Changed { before: Arc<T>, after: Arc<T>, patch: Patch },
	Deleted(Arc<T>),
}

impl<T> EntityEvent<T> {
	/// The record as it stands after the event (the removed record for `Deleted`).
	pub fn record(&self) -> &Arc<T> {
		match self {
			EntityEvent::Created(r) | EntityEvent::Deleted(r) => r,
			EntityEvent::Changed { after, .. } => after,
		}
	}
}

/// Raw resource payloads produced by completed REST calls.
#[derive(Debug, Clone)]
pub enum RestEvent {
	CurrentUser(Value),
	User(Value),
	World(Value),
	Avatar(Value),
	Favorite(Value),
	/// The favorite pointing at `object_id` was removed.
	FavoriteDeleted {
		object_id: String,
	},
	FavoriteGroup(Value),
	Notification(Value),
	NotificationSeen {
		id: String,
	},
	NotificationHidden {
		id: String,
	},
	PlayerModeration(Value),
	PlayerModerationDeleted {
		id: String,
	},
	FriendRemoved {
		user_id: String,
	},
}

/// Decoded push messages and connection transitions of the pipeline socket.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
	Connected,
	Disconnected {
		reason: String,
	},
	FriendAdd {
		user_id: String,
		user: Option<Value>,
	},
	FriendDelete {
		user_id: String,
	},
	FriendOnline {
		user_id: String,
		user: Option<Value>,
		location: Option<String>,
		platform: Option<String>,
	},
	FriendActive {
		user_id: String,
		user: Option<Value>,
	},
	FriendOffline {
		user_id: String,
	},
	FriendUpdate {
		user_id: String,
		user: Option<Value>,
	},
	FriendLocation {
		user_id: String,
		user: Option<Value>,
		location: Option<String>,
		traveling_to_location: Option<String>,
		world_name: Option<String>,
	},
	UserUpdate {
		user_id: String,
		user: Option<Value>,
	},
	UserLocation {
		user_id: String,
		location: Option<String>,
	},
	NotificationAdd(Value),
	NotificationSeen {
		id: String,
	},
	NotificationHidden {
		id: String,
	},
}

/// Output of the presence state machine.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
	StateChanged {
		user_id: String,
		from: FriendState,
		to: FriendState,
	},
	Feed(FeedEntry),
	FriendAdded {
		user_id: String,
		display_name: String,
	},
	FriendRemoved {
		user_id: String,
		display_name: String,
	},
	FriendRenamed {
		user_id: String,
		previous: String,
		display_name: String,
	},
	MemoChanged {
		user_id: String,
		memo: String,
	},
}

#[derive(Debug, Clone)]
pub enum FavoriteGroupEvent {
	/// Slots after a rebuild, in template order.
	Rebuilt(Vec<FavoriteSlot>),
	/// The slot binding table changed and should be persisted.
	BindingsChanged(SlotBindings),
	/// Ids of users currently held in friend favorite groups.
	FriendFavorites(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	/// A request failed for missing credentials; the client should try its stored login once.
	AutoLoginRequested,
	LoggedIn { user_id: String },
	LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
	Success,
	Info,
	Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
	pub level: ToastLevel,
	pub message: String,
}

impl Toast {
	pub fn success(message: impl Into<String>) -> Self {
		Self {
			level: ToastLevel::Success,
			message: message.into(),
		}
	}

	pub fn error(message: impl Into<String>) -> Self {
		Self {
			level: ToastLevel::Error,
			message: message.into(),
		}
	}
}
