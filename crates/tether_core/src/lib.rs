#![forbid(unsafe_code)]

pub mod bus;
pub mod cache;
pub mod dispatch;
pub mod events;
pub mod favorites;
pub mod feed;
pub mod presence;
pub mod store;



pub use bus::{EventBus, SubscriptionId};
pub use cache::{Applied, ApplyError, CachedEntity, Caches, EntityCache, RefreshTicket};
pub use dispatch::Dispatcher;
pub use events::{
	EntityEvent, Event, EventKind, FavoriteGroupEvent, PipelineEvent, PresenceEvent, RestEvent, SessionEvent, Toast,
	ToastLevel,
};
pub use favorites::{FavoriteGroups, FavoriteSlot, FavoritesConfig, SlotBindings, SlotRef, SlotTemplate};
pub use feed::{
	DispatchDecision, FeedCompositor, FeedConfig, FeedDetail, FeedEntry, FeedFilters, FeedKind, FeedSource,
	FilterLevel, FriendLogKind, NotifyChannels,
};
pub use presence::{Bucket, FriendSnapshot, FriendView, Presence, PresenceConfig, UpdateOutcome, UserSource};
pub use store::{FeedStore, FriendLogCurrent, FriendLogHistory, MemoryStore, install_persistence};
