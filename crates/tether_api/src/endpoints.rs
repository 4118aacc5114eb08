#![forbid(unsafe_code)]

//! Typed endpoints. Every successful call publishes one [`RestEvent`] per resource it
//! returned so the caches stay the single place where payloads are applied.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_core::{Event, RestEvent, SessionEvent, UserSource};
use tether_domain::{CurrentUser, FavoriteKind, User};
use tracing::debug;

use crate::gateway::{ApiError, CallOptions, RestGateway};
use crate::secret::SecretString;

pub const FRIENDS_PAGE: usize = 50;
pub const FAVORITES_PAGE: usize = 300;
pub const FAVORITE_GROUPS_PAGE: usize = 50;
pub const NOTIFICATIONS_PAGE: usize = 100;

/// Stops runaway pagination when the remote keeps returning full pages.
const MAX_PAGES: usize = 200;

#[derive(Clone)]
pub struct Api {
	gateway: RestGateway,
}

impl Api {
	pub fn new(gateway: RestGateway) -> Self {
		Self { gateway }
	}

	pub fn gateway(&self) -> &RestGateway {
		&self.gateway
	}

	fn publish(&self, ev: RestEvent) {
		self.gateway.bus().publish(Event::Rest(ev));
	}

	pub async fn current_user(&self) -> Result<CurrentUser, ApiError> {
		let payload = self.gateway.call("auth/user", CallOptions::get()).await?;
		let user: CurrentUser = decode("auth/user", &payload)?;
		self.publish(RestEvent::CurrentUser(payload));
		self.gateway.bus().publish(Event::Session(SessionEvent::LoggedIn {
			user_id: user.id.clone(),
		}));
		Ok(user)
	}

	/// Pipeline token for the current session. Returned, never published.
	pub async fn auth_token(&self) -> Result<SecretString, ApiError> {
		let payload = self.gateway.call("auth", CallOptions::get()).await?;
		payload
			.get("token")
			.and_then(Value::as_str)
			.filter(|t| !t.is_empty())
			.map(SecretString::new)
			.ok_or_else(|| ApiError::Decode {
				endpoint: "auth".to_string(),
				message: "missing token".to_string(),
			})
	}

	pub async fn logout(&self) -> Result<(), ApiError> {
		self.gateway.call("logout", CallOptions::put()).await?;
		Ok(())
	}

	pub async fn user(&self, user_id: &str) -> Result<User, ApiError> {
		let endpoint = format!("users/{user_id}");
		let payload = self.gateway.call(&endpoint, CallOptions::get()).await?;
		let user = decode(&endpoint, &payload)?;
		self.publish(RestEvent::User(payload));
		Ok(user)
	}

	pub async fn world(&self, world_id: &str) -> Result<Value, ApiError> {
		let payload = self.gateway.call(&format!("worlds/{world_id}"), CallOptions::get()).await?;
		self.publish(RestEvent::World(payload.clone()));
		Ok(payload)
	}

	pub async fn avatar(&self, avatar_id: &str) -> Result<Value, ApiError> {
		let payload = self.gateway.call(&format!("avatars/{avatar_id}"), CallOptions::get()).await?;
		self.publish(RestEvent::Avatar(payload.clone()));
		Ok(payload)
	}

	/// All online or offline friends, page by page. Returns the number of users seen.
	pub async fn friends(&self, offline: bool) -> Result<usize, ApiError> {
		let options = CallOptions::get().param("offline", offline);
		self.pages("auth/user/friends", options, FRIENDS_PAGE, RestEvent::User)
			.await
	}

	pub async fn favorites(&self) -> Result<usize, ApiError> {
		self.pages("favorites", CallOptions::get(), FAVORITES_PAGE, RestEvent::Favorite)
			.await
	}

	pub async fn favorite_groups(&self) -> Result<usize, ApiError> {
		self.pages(
			"favorite/groups",
			CallOptions::get(),
			FAVORITE_GROUPS_PAGE,
			RestEvent::FavoriteGroup,
		)
		.await
	}

	pub async fn notifications(&self) -> Result<usize, ApiError> {
		self.pages(
			"auth/user/notifications",
			CallOptions::get(),
			NOTIFICATIONS_PAGE,
			RestEvent::Notification,
		)
		.await
	}

	pub async fn player_moderations(&self) -> Result<usize, ApiError> {
		let payload = self
			.gateway
			.call("auth/user/playermoderations", CallOptions::get())
			.await?;
		let items = items("auth/user/playermoderations", payload)?;
		let count = items.len();
		for item in items {
			self.publish(RestEvent::PlayerModeration(item));
		}
		Ok(count)
	}

	pub async fn add_favorite(&self, kind: FavoriteKind, object_id: &str, tag: &str) -> Result<(), ApiError> {
		let options = CallOptions::post()
			.param("type", kind.as_str())
			.param("favoriteId", object_id)
			.param("tags", vec![tag.to_string()]);
		let payload = self.gateway.call("favorites", options).await?;
		self.publish(RestEvent::Favorite(payload));
		Ok(())
	}

	pub async fn delete_favorite(&self, object_id: &str) -> Result<(), ApiError> {
		self.gateway
			.call(&format!("favorites/{object_id}"), CallOptions::delete())
			.await?;
		self.publish(RestEvent::FavoriteDeleted {
			object_id: object_id.to_string(),
		});
		Ok(())
	}

	pub async fn see_notification(&self, id: &str) -> Result<(), ApiError> {
		self.gateway
			.call(&format!("auth/user/notifications/{id}/see"), CallOptions::put())
			.await?;
		self.publish(RestEvent::NotificationSeen { id: id.to_string() });
		Ok(())
	}

	pub async fn hide_notification(&self, id: &str) -> Result<(), ApiError> {
		self.gateway
			.call(&format!("auth/user/notifications/{id}/hide"), CallOptions::put())
			.await?;
		self.publish(RestEvent::NotificationHidden { id: id.to_string() });
		Ok(())
	}

	pub async fn unfriend(&self, user_id: &str) -> Result<(), ApiError> {
		self.gateway
			.call(&format!("auth/user/friends/{user_id}"), CallOptions::delete())
			.await?;
		self.publish(RestEvent::FriendRemoved {
			user_id: user_id.to_string(),
		});
		Ok(())
	}

	pub async fn unmoderate(&self, moderation_id: &str, moderated: &str, kind: &str) -> Result<(), ApiError> {
		let options = CallOptions::put().param("moderated", moderated).param("type", kind);
		self.gateway.call("auth/user/unplayermoderate", options).await?;
		self.publish(RestEvent::PlayerModerationDeleted {
			id: moderation_id.to_string(),
		});
		Ok(())
	}

	async fn pages(
		&self,
		endpoint: &str,
		options: CallOptions,
		page_size: usize,
		wrap: fn(Value) -> RestEvent,
	) -> Result<usize, ApiError> {
		let mut offset = 0;
		for _ in 0..MAX_PAGES {
			let page = options.clone().param("n", page_size).param("offset", offset);
			let payload = self.gateway.call(endpoint, page).await?;
			let items = items(endpoint, payload)?;
			let len = items.len();
			for item in items {
				self.publish(wrap(item));
			}
			offset += len;
			if len < page_size {
				debug!(%endpoint, total = offset, "api: pagination complete");
				return Ok(offset);
			}
		}
		debug!(%endpoint, total = offset, "api: pagination stopped at page limit");
		Ok(offset)
	}
}

#[async_trait]
impl UserSource for Api {
	async fn fetch_user(&self, user_id: &str) -> anyhow::Result<User> {
		Ok(self.user(user_id).await?)
	}
}

fn decode<T: DeserializeOwned>(endpoint: &str, payload: &Value) -> Result<T, ApiError> {
	T::deserialize(payload).map_err(|e| ApiError::Decode {
		endpoint: endpoint.to_string(),
		message: e.to_string(),
	})
}

fn items(endpoint: &str, payload: Value) -> Result<Vec<Value>, ApiError> {
	match payload {
		Value::Array(items) => Ok(items),
		other => Err(ApiError::Decode {
			endpoint: endpoint.to_string(),
			message: format!("expected an array, got {}", kind_of(&other)),
		}),
	}
}

fn kind_of(v: &Value) -> &'static str {
	match v {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
