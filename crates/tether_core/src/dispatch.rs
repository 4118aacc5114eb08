#![forbid(unsafe_code)]

//! Routes REST results and pipeline pushes into the caches and the presence state machine.

use anyhow::Context as _;
use serde_json::{Map, Value, json};
use tether_domain::{CurrentUser, FriendState, Location};
use tracing::{debug, info};

use crate::bus::{EventBus, SubscriptionId};
use crate::cache::Caches;
use crate::events::{EntityEvent, Event, EventKind, FavoriteGroupEvent, PipelineEvent, RestEvent};
use crate::presence::{FriendSnapshot, Presence};

#[derive(Clone)]
pub struct Dispatcher {
	bus: EventBus,
	caches: Caches,
	presence: Presence,
}

impl Dispatcher {
	pub fn new(bus: EventBus, caches: Caches, presence: Presence) -> Self {
		Self { bus, caches, presence }
	}

	pub fn install(&self) -> Vec<SubscriptionId> {
		let mut subs = Vec::with_capacity(4);

		let this = self.clone();
		subs.push(self.bus.subscribe(EventKind::Rest, move |ev| match ev {
			Event::Rest(ev) => this.on_rest(ev),
			_ => Ok(()),
		}));

		let this = self.clone();
		subs.push(self.bus.subscribe(EventKind::Pipeline, move |ev| match ev {
			Event::Pipeline(ev) => this.on_pipeline(ev),
			_ => Ok(()),
		}));

		let presence = self.presence.clone();
		subs.push(self.bus.subscribe(EventKind::User, move |ev| {
			match ev {
				Event::User(EntityEvent::Created(user)) => presence.on_user_updated(user, None),
				Event::User(EntityEvent::Changed { before, after, .. }) => presence.on_user_updated(after, Some(before)),
				_ => {}
			}
			Ok(())
		}));

		let presence = self.presence.clone();
		subs.push(self.bus.subscribe(EventKind::FavoriteGroups, move |ev| {
			if let Event::FavoriteGroups(FavoriteGroupEvent::FriendFavorites(ids)) = ev {
				presence.set_vip_friends(ids);
			}
			Ok(())
		}));

		subs
	}

	fn on_rest(&self, ev: &RestEvent) -> anyhow::Result<()> {
		let c = &self.caches;
		match ev {
			RestEvent::CurrentUser(payload) => {
				let user: CurrentUser =
					serde_json::from_value(payload.clone()).context("decode current user payload")?;
				self.presence
					.apply_friend_snapshot(&FriendSnapshot::from_current_user(&user));
			}
			RestEvent::User(payload) => {
				c.users.apply(payload).context("apply user")?;
			}
			RestEvent::World(payload) => {
				c.worlds.apply(payload).context("apply world")?;
			}
			RestEvent::Avatar(payload) => {
				c.avatars.apply(payload).context("apply avatar")?;
			}
			RestEvent::Favorite(payload) => {
				c.favorites.apply(payload).context("apply favorite")?;
			}
			RestEvent::FavoriteDeleted { object_id } => {
				if let Some(favorite) = c.favorites.get_by_secondary(object_id) {
					c.favorites.remove(&favorite.id);
				}
			}
			RestEvent::FavoriteGroup(payload) => {
				c.favorite_groups.apply(payload).context("apply favorite group")?;
			}
			RestEvent::Notification(payload) => {
				c.notifications.apply(payload).context("apply notification")?;
			}
			RestEvent::NotificationSeen { id } => self.mark_seen(id)?,
			RestEvent::NotificationHidden { id } => {
				c.notifications.remove(id);
			}
			RestEvent::PlayerModeration(payload) => {
				c.player_moderations.apply(payload).context("apply player moderation")?;
			}
			RestEvent::PlayerModerationDeleted { id } => {
				c.player_moderations.remove(id);
			}
			RestEvent::FriendRemoved { user_id } => {
				self.presence.remove_friend(user_id);
			}
		}
		Ok(())
	}

	fn on_pipeline(&self, ev: &PipelineEvent) -> anyhow::Result<()> {
		let c = &self.caches;
		match ev {
			PipelineEvent::Connected => info!("pipeline: connected"),
			PipelineEvent::Disconnected { reason } => info!(%reason, "pipeline: disconnected"),
			PipelineEvent::FriendAdd { user_id, user } => {
				if let Some(user) = user {
					c.users
						.apply(&user_payload(user_id, Some(user), &[]))
						.context("apply added friend")?;
				}
				self.presence.add_friend(user_id, c.users.get(user_id));
			}
			PipelineEvent::FriendDelete { user_id } => {
				self.presence.remove_friend(user_id);
			}
			PipelineEvent::FriendOnline {
				user_id,
				user,
				location,
				platform,
			} => {
				let payload = user_payload(
					user_id,
					user.as_ref(),
					&[
						("state", Some(FriendState::Online.as_str())),
						("location", location.as_deref()),
						("lastPlatform", platform.as_deref()),
					],
				);
				c.users.apply(&payload).context("apply online friend")?;
				self.presence.record_online_push(user_id);
				self.presence.spawn_update(user_id, Some(FriendState::Online));
			}
			PipelineEvent::FriendActive { user_id, user } => {
				let payload = user_payload(user_id, user.as_ref(), &[("state", Some(FriendState::Active.as_str()))]);
				c.users.apply(&payload).context("apply active friend")?;
				self.presence.spawn_update(user_id, Some(FriendState::Active));
			}
			PipelineEvent::FriendOffline { user_id } => {
				self.presence.spawn_update(user_id, Some(FriendState::Offline));
			}
			PipelineEvent::FriendUpdate { user_id, user } | PipelineEvent::UserUpdate { user_id, user } => {
				if let Some(user) = user {
					c.users
						.apply(&user_payload(user_id, Some(user), &[]))
						.context("apply user update")?;
				}
			}
			PipelineEvent::FriendLocation {
				user_id,
				user,
				location,
				traveling_to_location,
				world_name,
			} => {
				let payload = user_payload(
					user_id,
					user.as_ref(),
					&[
						("location", location.as_deref()),
						("travelingToLocation", traveling_to_location.as_deref()),
					],
				);
				c.users.apply(&payload).context("apply friend location")?;

				if let Some(location) = location {
					self.presence.update_location(user_id, location, world_name.clone());
					if !Location::parse(location).is_offline {
						self.presence.record_online_push(user_id);
					}
				}
			}
			PipelineEvent::UserLocation { user_id, location } => {
				debug!(user = %user_id, location = ?location, "pipeline: own location changed");
			}
			PipelineEvent::NotificationAdd(payload) => {
				c.notifications.apply(payload).context("apply pushed notification")?;
			}
			PipelineEvent::NotificationSeen { id } => self.mark_seen(id)?,
			PipelineEvent::NotificationHidden { id } => {
				c.notifications.remove(id);
			}
		}
		Ok(())
	}

	fn mark_seen(&self, id: &str) -> anyhow::Result<()> {
		if self.caches.notifications.contains(id) {
			self.caches
				.notifications
				.apply(&json!({ "id": id, "seen": true }))
				.context("mark notification seen")?;
		}
		Ok(())
	}
}

/// Pushed user object with the message-level fields laid over it.
fn user_payload(user_id: &str, user: Option<&Value>, extra: &[(&str, Option<&str>)]) -> Value {
	let mut map = match user {
		Some(Value::Object(map)) => map.clone(),
		_ => Map::new(),
	};
	map.insert("id".to_string(), Value::String(user_id.to_string()));
	for (key, value) in extra {
		if let Some(value) = value {
			map.insert((*key).to_string(), Value::String((*value).to_string()));
		}
	}
	Value::Object(map)
}
