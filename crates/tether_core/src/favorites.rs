#![forbid(unsafe_code)]

//! Maps server favorite groups onto the fixed slot template.
//!
//! Slots are bound in three passes: the persisted [`SlotBindings`] table first, then an
//! exact name match, then the first free slot of the same type. Once a group is bound its
//! slot stays with it across rebuilds, whatever order the server lists groups in.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_domain::{Entity, Favorite, FavoriteGroup, FavoriteKind, group_key};
use tracing::{debug, warn};

use crate::bus::{EventBus, SubscriptionId};
use crate::events::{EntityEvent, Event, EventKind, FavoriteGroupEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTemplate {
	pub kind: FavoriteKind,
	pub count: usize,
	pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavoritesConfig {
	pub templates: Vec<SlotTemplate>,
}

impl Default for FavoritesConfig {
	fn default() -> Self {
		Self {
			templates: vec![
				SlotTemplate {
					kind: FavoriteKind::Friend,
					count: 3,
					capacity: 64,
				},
				SlotTemplate {
					kind: FavoriteKind::World,
					count: 4,
					capacity: 64,
				},
				SlotTemplate {
					kind: FavoriteKind::Avatar,
					count: 4,
					capacity: 25,
				},
			],
		}
	}
}

impl FavoritesConfig {
	fn slot_count(&self, kind: FavoriteKind) -> usize {
		self.templates.iter().filter(|t| t.kind == kind).map(|t| t.count).sum()
	}
}

/// One template slot, possibly bound to a server group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavoriteSlot {
	pub kind: FavoriteKind,
	/// Position among the slots of the same kind.
	pub index: usize,
	/// `type:name`, matched against [`Favorite::group_key`].
	pub key: String,
	pub name: String,
	pub display_name: String,
	pub visibility: String,
	pub capacity: usize,
	pub group_id: Option<String>,
	pub count: usize,
}

impl FavoriteSlot {
	fn blank(kind: FavoriteKind, index: usize, capacity: usize) -> Self {
		let name = match kind {
			FavoriteKind::Friend => format!("group_{index}"),
			FavoriteKind::World => format!("worlds{}", index + 1),
			FavoriteKind::Avatar => format!("avatars{}", index + 1),
		};
		Self {
			kind,
			index,
			key: group_key(kind, &name),
			name,
			display_name: format!("Group {}", index + 1),
			visibility: "private".to_string(),
			capacity,
			group_id: None,
			count: 0,
		}
	}

	pub fn is_full(&self) -> bool {
		self.count >= self.capacity
	}

	fn bind(&mut self, group: &FavoriteGroup) {
		self.group_id = Some(group.id.clone());
		if !group.name.is_empty() {
			self.name = group.name.clone();
			self.key = group_key(self.kind, &self.name);
		}
		// Avatar groups keep their template labels.
		if self.kind != FavoriteKind::Avatar {
			if !group.display_name.is_empty() {
				self.display_name = group.display_name.clone();
			}
			if !group.visibility.is_empty() {
				self.visibility = group.visibility.clone();
			}
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
	pub kind: FavoriteKind,
	pub index: usize,
}

/// Persisted server group id to slot mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotBindings(BTreeMap<String, SlotRef>);

impl SlotBindings {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, group_id: &str) -> Option<SlotRef> {
		self.0.get(group_id).copied()
	}

	pub fn insert(&mut self, group_id: impl Into<String>, slot: SlotRef) {
		self.0.insert(group_id.into(), slot);
	}

	pub fn remove(&mut self, group_id: &str) -> Option<SlotRef> {
		self.0.remove(group_id)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, SlotRef)> {
		self.0.iter().map(|(k, v)| (k.as_str(), *v))
	}
}

/// Unbound slots in template order.
pub fn template_slots(config: &FavoritesConfig) -> Vec<FavoriteSlot> {
	let mut next: HashMap<FavoriteKind, usize> = HashMap::new();
	let mut slots = Vec::new();
	for template in &config.templates {
		for _ in 0..template.count {
			let index = next.entry(template.kind).or_default();
			slots.push(FavoriteSlot::blank(template.kind, *index, template.capacity));
			*index += 1;
		}
	}
	slots
}

/// Bind `groups` (in received order) to template slots.
///
/// Returns the slots, with zero counts, and the updated binding table. Entries for groups
/// not in `groups` are kept and their slots are only handed to other groups once no
/// unreserved slot of the type is left.
pub fn assign_slots(
	config: &FavoritesConfig,
	groups: &[Arc<FavoriteGroup>],
	bindings: &SlotBindings,
) -> (Vec<FavoriteSlot>, SlotBindings) {
	let mut slots = template_slots(config);
	let mut bound = vec![false; groups.len()];

	let position = |slots: &[FavoriteSlot], slot: SlotRef| {
		slots.iter().position(|s| s.kind == slot.kind && s.index == slot.index)
	};

	let present: HashSet<&str> = groups.iter().map(|g| g.id.as_str()).collect();
	let reserved: HashSet<SlotRef> = bindings
		.iter()
		.filter(|(id, _)| !present.contains(id))
		.map(|(_, slot)| slot)
		.collect();
	let is_reserved = |slot: &FavoriteSlot| {
		reserved.contains(&SlotRef {
			kind: slot.kind,
			index: slot.index,
		})
	};

	// Pass 0: remembered bindings.
	for (gi, group) in groups.iter().enumerate() {
		let Some(slot) = bindings.get(&group.id) else {
			continue;
		};
		if slot.kind != group.kind || slot.index >= config.slot_count(group.kind) {
			continue;
		}
		if let Some(si) = position(&slots, slot)
			&& slots[si].group_id.is_none()
		{
			slots[si].bind(group);
			bound[gi] = true;
		}
	}

	// Pass 1: exact name match.
	for (gi, group) in groups.iter().enumerate() {
		if bound[gi] {
			continue;
		}
		let free = |s: &FavoriteSlot| s.group_id.is_none() && s.kind == group.kind && s.name == group.name;
		let si = slots
			.iter()
			.position(|s| free(s) && !is_reserved(s))
			.or_else(|| slots.iter().position(free));
		if let Some(si) = si {
			slots[si].bind(group);
			bound[gi] = true;
		}
	}

	// Pass 2: first free slot of the type.
	for (gi, group) in groups.iter().enumerate() {
		if bound[gi] {
			continue;
		}
		let free = |s: &FavoriteSlot| s.group_id.is_none() && s.kind == group.kind;
		let si = slots
			.iter()
			.position(|s| free(s) && !is_reserved(s))
			.or_else(|| slots.iter().position(free));
		match si {
			Some(si) => {
				slots[si].bind(group);
				bound[gi] = true;
			}
			None => debug!(group = %group.id, kind = %group.kind, "favorites: no free slot for group"),
		}
	}

	let taken: HashSet<SlotRef> = slots
		.iter()
		.filter(|s| s.group_id.is_some())
		.map(|s| SlotRef {
			kind: s.kind,
			index: s.index,
		})
		.collect();
	let mut table = SlotBindings::new();
	for (id, slot) in bindings.iter() {
		if !present.contains(id) && !taken.contains(&slot) {
			table.insert(id, slot);
		}
	}
	for slot in &slots {
		if let Some(id) = &slot.group_id {
			table.insert(
				id.clone(),
				SlotRef {
					kind: slot.kind,
					index: slot.index,
				},
			);
		}
	}

	(slots, table)
}

/// Recompute every slot's occupancy by scanning `favorites`.
pub fn recount<'a>(slots: &mut [FavoriteSlot], favorites: impl IntoIterator<Item = &'a Favorite>) {
	let mut counts: HashMap<&str, usize> = HashMap::new();
	for favorite in favorites {
		*counts.entry(favorite.group_key.as_str()).or_default() += 1;
	}
	for slot in slots.iter_mut() {
		slot.count = counts.get(slot.key.as_str()).copied().unwrap_or(0);
	}
}

/// Live favorite-group view kept in sync from cache events on the bus.
#[derive(Clone)]
pub struct FavoriteGroups {
	bus: EventBus,
	config: Arc<FavoritesConfig>,
	state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
	/// Server groups in first-seen order.
	groups: Vec<Arc<FavoriteGroup>>,
	favorites: HashMap<String, Arc<Favorite>>,
	bindings: SlotBindings,
	/// The table lost an entry outside a rebuild and has not been published yet.
	bindings_dirty: bool,
	slots: Vec<FavoriteSlot>,
	friend_ids: BTreeSet<String>,
}

impl FavoriteGroups {
	pub fn new(bus: EventBus, config: FavoritesConfig, bindings: SlotBindings) -> Self {
		let slots = template_slots(&config);
		Self {
			bus,
			config: Arc::new(config),
			state: Arc::new(Mutex::new(State {
				bindings,
				slots,
				..State::default()
			})),
		}
	}

	pub fn install(&self) -> Vec<SubscriptionId> {
		let groups = {
			let this = self.clone();
			self.bus.subscribe(EventKind::FavoriteGroup, move |ev| {
				if let Event::FavoriteGroup(ev) = ev {
					this.on_group_event(ev);
				}
				Ok(())
			})
		};
		let favorites = {
			let this = self.clone();
			self.bus.subscribe(EventKind::Favorite, move |ev| {
				if let Event::Favorite(ev) = ev {
					this.on_favorite_event(ev);
				}
				Ok(())
			})
		};
		vec![groups, favorites]
	}

	pub fn slots(&self) -> Vec<FavoriteSlot> {
		self.state.lock().slots.clone()
	}

	pub fn slot(&self, key: &str) -> Option<FavoriteSlot> {
		self.state.lock().slots.iter().find(|s| s.key == key).cloned()
	}

	pub fn bindings(&self) -> SlotBindings {
		self.state.lock().bindings.clone()
	}

	pub fn friend_favorites(&self) -> BTreeSet<String> {
		self.state.lock().friend_ids.clone()
	}

	fn on_group_event(&self, ev: &EntityEvent<FavoriteGroup>) {
		{
			let mut st = self.state.lock();
			match ev {
				EntityEvent::Created(g) | EntityEvent::Changed { after: g, .. } => {
					match st.groups.iter_mut().find(|x| x.id == g.id) {
						Some(slot) => *slot = g.clone(),
						None => st.groups.push(g.clone()),
					}
				}
				EntityEvent::Deleted(g) => {
					st.groups.retain(|x| x.id != g.id);
					// Its slot is free again.
					if st.bindings.remove(&g.id).is_some() {
						st.bindings_dirty = true;
					}
				}
			}
		}
		self.rebuild();
	}

	fn on_favorite_event(&self, ev: &EntityEvent<Favorite>) {
		{
			let mut st = self.state.lock();
			match ev {
				EntityEvent::Created(f) | EntityEvent::Changed { after: f, .. } => {
					st.favorites.insert(f.id().to_string(), f.clone());
				}
				EntityEvent::Deleted(f) => {
					st.favorites.remove(f.id());
				}
			}
		}
		self.refresh_counts();
	}

	/// Rebind every group and recount. Publishes the new slots, plus the binding table and
	/// friend set when they changed.
	pub fn rebuild(&self) {
		let (slots, bindings, friends) = {
			let mut st = self.state.lock();
			let (mut slots, table) = assign_slots(&self.config, &st.groups, &st.bindings);
			recount(&mut slots, st.favorites.values().map(Arc::as_ref));
			for slot in slots.iter().filter(|s| s.count > s.capacity) {
				warn!(slot = %slot.key, count = slot.count, capacity = slot.capacity, "favorites: slot over capacity");
			}
			st.slots = slots.clone();

			let changed = table != st.bindings || st.bindings_dirty;
			st.bindings_dirty = false;
			let bindings = changed.then(|| {
				st.bindings = table.clone();
				table
			});
			(slots, bindings, update_friend_ids(&mut st))
		};

		debug!(slots = slots.len(), "favorites: rebuilt");
		self.bus.publish(Event::FavoriteGroups(FavoriteGroupEvent::Rebuilt(slots)));
		if let Some(bindings) = bindings {
			self.bus.publish(Event::FavoriteGroups(FavoriteGroupEvent::BindingsChanged(bindings)));
		}
		if let Some(friends) = friends {
			self.bus.publish(Event::FavoriteGroups(FavoriteGroupEvent::FriendFavorites(friends)));
		}
	}

	fn refresh_counts(&self) {
		let (slots, friends) = {
			let mut st = self.state.lock();
			let State { slots, favorites, .. } = &mut *st;
			recount(slots, favorites.values().map(Arc::as_ref));
			(st.slots.clone(), update_friend_ids(&mut st))
		};
		self.bus.publish(Event::FavoriteGroups(FavoriteGroupEvent::Rebuilt(slots)));
		if let Some(friends) = friends {
			self.bus.publish(Event::FavoriteGroups(FavoriteGroupEvent::FriendFavorites(friends)));
		}
	}

	/// Forget the mirrored server state (logout). The binding table is kept.
	pub fn reset(&self) {
		let mut st = self.state.lock();
		st.groups.clear();
		st.favorites.clear();
		st.friend_ids.clear();
		st.slots = template_slots(&self.config);
	}
}

/// Recompute the favorited-friend set; `Some` when it changed.
fn update_friend_ids(st: &mut State) -> Option<BTreeSet<String>> {
	let friend_keys: BTreeSet<&str> = st
		.slots
		.iter()
		.filter(|s| s.kind == FavoriteKind::Friend)
		.map(|s| s.key.as_str())
		.collect();
	let ids: BTreeSet<String> = st
		.favorites
		.values()
		.filter(|f| f.kind == FavoriteKind::Friend && friend_keys.contains(f.group_key.as_str()))
		.map(|f| f.favorite_id.clone())
		.collect();

	if ids == st.friend_ids {
		return None;
	}
	st.friend_ids = ids.clone();
	Some(ids)
}
