#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tether_domain::{
	Avatar, Entity, EntityKind, Favorite, FavoriteGroup, Notification, Patch, PlayerModeration, User, World,
};
use thiserror::Error;
use tracing::debug;

use crate::bus::EventBus;
use crate::events::{EntityEvent, Event};

/// An [`Entity`] that can announce its cache lifecycle on the bus.
pub trait CachedEntity: Entity {
	fn into_event(event: EntityEvent<Self>) -> Event;
}

macro_rules! cached_entity {
	($($ty:ident),+ $(,)?) => {
		$(
			impl CachedEntity for $ty {
				fn into_event(event: EntityEvent<Self>) -> Event {
					Event::$ty(event)
				}
			}
		)+
	};
}

cached_entity!(User, World, Avatar, Favorite, FavoriteGroup, Notification, PlayerModeration);

#[derive(Debug, Error)]
pub enum ApplyError {
	#[error("{kind} payload has no id")]
	MissingId { kind: EntityKind },

	#[error("decode {kind} payload: {source}")]
	Decode {
		kind: EntityKind,
		#[source]
		source: serde_json::Error,
	},
}

/// Result of [`EntityCache::apply`].
#[derive(Debug, Clone)]
pub enum Applied<T> {
	Created(Arc<T>),
	Changed { record: Arc<T>, patch: Patch },
	Unchanged(Arc<T>),
}

impl<T> Applied<T> {
	pub fn record(&self) -> &Arc<T> {
		match self {
			Applied::Created(r) | Applied::Unchanged(r) => r,
			Applied::Changed { record, .. } => record,
		}
	}

	pub fn is_unchanged(&self) -> bool {
		matches!(self, Applied::Unchanged(_))
	}
}

/// Id-keyed mirror of one entity family with create-or-merge updates and
/// mark/expire/sweep deletion.
pub struct EntityCache<T: CachedEntity> {
	inner: Arc<Mutex<Inner<T>>>,
	bus: EventBus,
}

impl<T: CachedEntity> Clone for EntityCache<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
			bus: self.bus.clone(),
		}
	}
}

struct Inner<T> {
	records: HashMap<String, Slot<T>>,
	secondary: HashMap<String, String>,
}

struct Slot<T> {
	record: Arc<T>,
	/// Set by `mark_all_stale`, cleared by any later sighting.
	stale: bool,
}

impl<T: CachedEntity> EntityCache<T> {
	pub fn new(bus: EventBus) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner {
				records: HashMap::new(),
				secondary: HashMap::new(),
			})),
			bus,
		}
	}

	/// Create or merge a record from a server payload.
	///
	/// Re-applying an identical payload returns the same `Arc` and publishes nothing.
	pub fn apply(&self, payload: &Value) -> Result<Applied<T>, ApplyError> {
		let id = payload
			.get("id")
			.and_then(Value::as_str)
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.ok_or(ApplyError::MissingId { kind: T::KIND })?;

		let decode = |source| ApplyError::Decode { kind: T::KIND, source };

		let (applied, event) = {
			let mut inner = self.inner.lock();
			let Inner { records, secondary } = &mut *inner;

			match records.get_mut(id) {
				Some(slot) => {
					slot.stale = false;
					let merged = slot.record.merged_with(payload).map_err(decode)?;
					let patch = merged.diff(&slot.record);
					if patch.is_empty() {
						(Applied::Unchanged(slot.record.clone()), None)
					} else {
						let before = std::mem::replace(&mut slot.record, Arc::new(merged));
						reindex(secondary, id, before.secondary_key(), slot.record.secondary_key());
						let after = slot.record.clone();
						(
							Applied::Changed {
								record: after.clone(),
								patch: patch.clone(),
							},
							Some(EntityEvent::Changed { before, after, patch }),
						)
					}
				}
				None => {
					let record = Arc::new(T::from_payload(payload).map_err(decode)?);
					reindex(secondary, id, None, record.secondary_key());
					records.insert(
						id.to_string(),
						Slot {
							record: record.clone(),
							stale: false,
						},
					);
					(Applied::Created(record.clone()), Some(EntityEvent::Created(record)))
				}
			}
		};

		if let Some(event) = event {
			self.bus.publish(T::into_event(event));
		}

		Ok(applied)
	}

	pub fn get(&self, id: &str) -> Option<Arc<T>> {
		self.inner.lock().records.get(id).map(|s| s.record.clone())
	}

	pub fn get_by_secondary(&self, key: &str) -> Option<Arc<T>> {
		let inner = self.inner.lock();
		let id = inner.secondary.get(key)?;
		inner.records.get(id).map(|s| s.record.clone())
	}

	pub fn contains(&self, id: &str) -> bool {
		self.inner.lock().records.contains_key(id)
	}

	pub fn is_stale(&self, id: &str) -> bool {
		self.inner.lock().records.get(id).is_some_and(|s| s.stale)
	}

	pub fn values(&self) -> Vec<Arc<T>> {
		self.inner.lock().records.values().map(|s| s.record.clone()).collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().records.is_empty()
	}

	/// Remove one record, publishing `Deleted`.
	pub fn remove(&self, id: &str) -> Option<Arc<T>> {
		let removed = {
			let mut inner = self.inner.lock();
			let slot = inner.records.remove(id)?;
			if let Some(key) = slot.record.secondary_key() {
				inner.secondary.remove(key);
			}
			slot.record
		};
		self.bus.publish(T::into_event(EntityEvent::Deleted(removed.clone())));
		Some(removed)
	}

	/// Mark every record stale ahead of a bulk refresh. Returns the number marked.
	pub fn mark_all_stale(&self) -> usize {
		let mut inner = self.inner.lock();
		for slot in inner.records.values_mut() {
			slot.stale = true;
		}
		inner.records.len()
	}

	/// Remove every record still marked stale, publishing `Deleted` for each.
	pub fn sweep_stale(&self) -> Vec<Arc<T>> {
		let removed: Vec<Arc<T>> = {
			let mut inner = self.inner.lock();
			let Inner { records, secondary } = &mut *inner;
			let stale: Vec<String> = records.iter().filter(|(_, s)| s.stale).map(|(id, _)| id.clone()).collect();
			stale
				.into_iter()
				.filter_map(|id| records.remove(&id))
				.map(|slot| {
					if let Some(key) = slot.record.secondary_key() {
						secondary.remove(key);
					}
					slot.record
				})
				.collect()
		};

		if !removed.is_empty() {
			debug!(kind = %T::KIND, removed = removed.len(), "cache: swept stale records");
		}
		for record in &removed {
			self.bus.publish(T::into_event(EntityEvent::Deleted(record.clone())));
		}
		removed
	}

	/// Start a bulk refresh: marks everything stale and returns a ticket that sweeps on
	/// [`RefreshTicket::finish`]. Dropping the ticket unfinished leaves the cache intact.
	pub fn begin_refresh(&self) -> RefreshTicket<T> {
		let marked = self.mark_all_stale();
		debug!(kind = %T::KIND, marked, "cache: bulk refresh started");
		RefreshTicket {
			cache: self.clone(),
			finished: false,
		}
	}

	/// Drop all records without publishing (logout).
	pub fn clear(&self) {
		let mut inner = self.inner.lock();
		inner.records.clear();
		inner.secondary.clear();
	}
}

fn reindex(secondary: &mut HashMap<String, String>, id: &str, old: Option<&str>, new: Option<&str>) {
	if old == new {
		return;
	}
	if let Some(old) = old
		&& secondary.get(old).is_some_and(|owner| owner == id)
	{
		secondary.remove(old);
	}
	if let Some(new) = new {
		secondary.insert(new.to_string(), id.to_string());
	}
}

/// In-progress bulk refresh of an [`EntityCache`].
pub struct RefreshTicket<T: CachedEntity> {
	cache: EntityCache<T>,
	finished: bool,
}

impl<T: CachedEntity> RefreshTicket<T> {
	/// Every page was consumed: delete whatever was not seen.
	pub fn finish(mut self) -> Vec<Arc<T>> {
		self.finished = true;
		self.cache.sweep_stale()
	}
}

impl<T: CachedEntity> Drop for RefreshTicket<T> {
	fn drop(&mut self) {
		if !self.finished {
			debug!(kind = %T::KIND, "cache: bulk refresh abandoned; skipping sweep");
		}
	}
}

/// One cache per entity family, sharing a bus.
#[derive(Clone)]
pub struct Caches {
	pub users: EntityCache<User>,
	pub worlds: EntityCache<World>,
	pub avatars: EntityCache<Avatar>,
	pub favorites: EntityCache<Favorite>,
	pub favorite_groups: EntityCache<FavoriteGroup>,
	pub notifications: EntityCache<Notification>,
	pub player_moderations: EntityCache<PlayerModeration>,
}

impl Caches {
	pub fn new(bus: &EventBus) -> Self {
		Self {
			users: EntityCache::new(bus.clone()),
			worlds: EntityCache::new(bus.clone()),
			avatars: EntityCache::new(bus.clone()),
			favorites: EntityCache::new(bus.clone()),
			favorite_groups: EntityCache::new(bus.clone()),
			notifications: EntityCache::new(bus.clone()),
			player_moderations: EntityCache::new(bus.clone()),
		}
	}

	pub fn clear(&self) {
		self.users.clear();
		self.worlds.clear();
		self.avatars.clear();
		self.favorites.clear();
		self.favorite_groups.clear();
		self.notifications.clear();
		self.player_moderations.clear();
	}
}
