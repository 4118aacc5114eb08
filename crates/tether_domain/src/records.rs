#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, Patch};
use crate::{EntityKind, FavoriteKind, FriendState, Location, diff_fields, group_key};

/// A platform user as seen by the client (friend or not).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
	pub id: String,
	pub display_name: String,
	pub bio: String,
	pub status: String,
	pub status_description: String,
	pub state: Option<FriendState>,
	pub location: Option<String>,
	pub world_id: Option<String>,
	pub instance_id: Option<String>,
	pub traveling_to_location: Option<String>,
	pub current_avatar_image_url: String,
	pub current_avatar_thumbnail_image_url: String,
	pub last_platform: String,
	pub last_login: Option<String>,
	pub is_friend: bool,
	pub tags: Vec<String>,

	/// Trust rank derived from `tags`.
	#[serde(skip)]
	pub trust_level: TrustLevel,
}

/// Trust rank, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustLevel {
	#[default]
	Visitor,
	New,
	User,
	Known,
	Trusted,
}

impl User {
	/// Presence implied by the server attributes.
	///
	/// An explicit `state` wins; otherwise an `offline` location means offline and any
	/// other location means online.
	pub fn presence(&self) -> FriendState {
		if let Some(state) = self.state {
			return state;
		}
		match self.location.as_deref() {
			Some(tag) if !Location::parse(tag).is_offline => FriendState::Online,
			_ => FriendState::Offline,
		}
	}

	pub fn location(&self) -> Location {
		Location::parse(self.location.as_deref().unwrap_or_default())
	}
}

impl Entity for User {
	const KIND: EntityKind = EntityKind::User;

	fn id(&self) -> &str {
		&self.id
	}

	fn diff(&self, previous: &Self) -> Patch {
		diff_fields!(previous, self;
			display_name => "displayName",
			bio => "bio",
			status => "status",
			status_description => "statusDescription",
			state => "state",
			location => "location",
			world_id => "worldId",
			instance_id => "instanceId",
			traveling_to_location => "travelingToLocation",
			current_avatar_image_url => "currentAvatarImageUrl",
			current_avatar_thumbnail_image_url => "currentAvatarThumbnailImageUrl",
			last_platform => "lastPlatform",
			last_login => "lastLogin",
			is_friend => "isFriend",
			tags => "tags",
		)
	}

	fn derive(&mut self) {
		let has = |tag: &str| self.tags.iter().any(|t| t == tag);
		self.trust_level = if has("system_trust_veteran") {
			TrustLevel::Trusted
		} else if has("system_trust_trusted") {
			TrustLevel::Known
		} else if has("system_trust_known") {
			TrustLevel::User
		} else if has("system_trust_basic") {
			TrustLevel::New
		} else {
			TrustLevel::Visitor
		};
	}
}

/// The logged-in user, including the friend id lists used for full presence refresh.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CurrentUser {
	pub id: String,
	pub display_name: String,
	pub friends: Vec<String>,
	pub online_friends: Vec<String>,
	pub active_friends: Vec<String>,
	pub offline_friends: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct World {
	pub id: String,
	pub name: String,
	pub author_id: String,
	pub author_name: String,
	pub description: String,
	pub image_url: String,
	pub thumbnail_image_url: String,
	pub capacity: u32,
	pub occupants: u32,
	pub favorites: u64,
	pub visits: u64,
	pub release_status: String,
	pub tags: Vec<String>,
	pub updated_at: Option<String>,

	/// Tagged as a community-labs world.
	#[serde(skip)]
	pub is_labs: bool,
}

impl Entity for World {
	const KIND: EntityKind = EntityKind::World;

	fn id(&self) -> &str {
		&self.id
	}

	fn diff(&self, previous: &Self) -> Patch {
		diff_fields!(previous, self;
			name => "name",
			author_id => "authorId",
			author_name => "authorName",
			description => "description",
			image_url => "imageUrl",
			thumbnail_image_url => "thumbnailImageUrl",
			capacity => "capacity",
			occupants => "occupants",
			favorites => "favorites",
			visits => "visits",
			release_status => "releaseStatus",
			tags => "tags",
			updated_at => "updatedAt",
		)
	}

	fn derive(&mut self) {
		self.is_labs = self.tags.iter().any(|t| t == "system_labs");
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Avatar {
	pub id: String,
	pub name: String,
	pub author_id: String,
	pub author_name: String,
	pub description: String,
	pub image_url: String,
	pub thumbnail_image_url: String,
	pub release_status: String,
	pub version: u32,
	pub tags: Vec<String>,
}

impl Entity for Avatar {
	const KIND: EntityKind = EntityKind::Avatar;

	fn id(&self) -> &str {
		&self.id
	}

	fn diff(&self, previous: &Self) -> Patch {
		diff_fields!(previous, self;
			name => "name",
			author_id => "authorId",
			author_name => "authorName",
			description => "description",
			image_url => "imageUrl",
			thumbnail_image_url => "thumbnailImageUrl",
			release_status => "releaseStatus",
			version => "version",
			tags => "tags",
		)
	}
}

/// A favorite pointing at a user, world or avatar, tagged with its group name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Favorite {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: FavoriteKind,
	pub favorite_id: String,
	pub tags: Vec<String>,

	/// `type:tag` key of the group this favorite belongs to.
	#[serde(skip)]
	pub group_key: String,
}

impl Entity for Favorite {
	const KIND: EntityKind = EntityKind::Favorite;

	fn id(&self) -> &str {
		&self.id
	}

	fn secondary_key(&self) -> Option<&str> {
		if self.favorite_id.is_empty() {
			None
		} else {
			Some(&self.favorite_id)
		}
	}

	fn diff(&self, previous: &Self) -> Patch {
		diff_fields!(previous, self;
			kind => "type",
			favorite_id => "favoriteId",
			tags => "tags",
		)
	}

	fn derive(&mut self) {
		let tag = self.tags.first().map(String::as_str).unwrap_or_default();
		self.group_key = group_key(self.kind, tag);
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FavoriteGroup {
	pub id: String,
	pub owner_id: String,
	pub name: String,
	pub display_name: String,
	#[serde(rename = "type")]
	pub kind: FavoriteKind,
	pub visibility: String,
	pub tags: Vec<String>,
}

impl Entity for FavoriteGroup {
	const KIND: EntityKind = EntityKind::FavoriteGroup;

	fn id(&self) -> &str {
		&self.id
	}

	fn diff(&self, previous: &Self) -> Patch {
		diff_fields!(previous, self;
			owner_id => "ownerId",
			name => "name",
			display_name => "displayName",
			kind => "type",
			visibility => "visibility",
			tags => "tags",
		)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Notification {
	pub id: String,
	pub sender_user_id: String,
	pub sender_username: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub message: String,
	pub details: Value,
	pub seen: bool,
	pub created_at: Option<String>,
}

impl Entity for Notification {
	const KIND: EntityKind = EntityKind::Notification;

	fn id(&self) -> &str {
		&self.id
	}

	fn diff(&self, previous: &Self) -> Patch {
		diff_fields!(previous, self;
			sender_user_id => "senderUserId",
			sender_username => "senderUsername",
			kind => "type",
			message => "message",
			details => "details",
			seen => "seen",
			created_at => "createdAt",
		)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerModeration {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub source_user_id: String,
	pub source_display_name: String,
	pub target_user_id: String,
	pub target_display_name: String,
	pub created: Option<String>,
}

impl Entity for PlayerModeration {
	const KIND: EntityKind = EntityKind::PlayerModeration;

	fn id(&self) -> &str {
		&self.id
	}

	fn diff(&self, previous: &Self) -> Patch {
		diff_fields!(previous, self;
			kind => "type",
			source_user_id => "sourceUserId",
			source_display_name => "sourceDisplayName",
			target_user_id => "targetUserId",
			target_display_name => "targetDisplayName",
			created => "created",
		)
	}
}
