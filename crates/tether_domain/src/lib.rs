#![forbid(unsafe_code)]

mod entity;
mod records;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use entity::{Entity, FieldChange, Patch};
pub use records::{
	Avatar, CurrentUser, Favorite, FavoriteGroup, Notification, PlayerModeration, TrustLevel, User, World,
};

/// Errors for parsing identifiers and enum tags from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown friend state: {0}")]
	UnknownState(String),
	#[error("unknown favorite type: {0}")]
	UnknownFavoriteKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Materialized presence of a friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendState {
	Online,
	Active,
	#[default]
	Offline,
}

impl FriendState {
	/// Stable string identifier (matches the wire format).
	pub const fn as_str(self) -> &'static str {
		match self {
			FriendState::Online => "online",
			FriendState::Active => "active",
			FriendState::Offline => "offline",
		}
	}
}

impl fmt::Display for FriendState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for FriendState {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"online" => Ok(FriendState::Online),
			"active" => Ok(FriendState::Active),
			"offline" => Ok(FriendState::Offline),
			other => Err(ParseIdError::UnknownState(other.to_string())),
		}
	}
}

/// Cached entity families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
	User,
	World,
	Avatar,
	Favorite,
	FavoriteGroup,
	Notification,
	PlayerModeration,
}

impl EntityKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			EntityKind::User => "user",
			EntityKind::World => "world",
			EntityKind::Avatar => "avatar",
			EntityKind::Favorite => "favorite",
			EntityKind::FavoriteGroup => "favorite_group",
			EntityKind::Notification => "notification",
			EntityKind::PlayerModeration => "player_moderation",
		}
	}
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Object type a favorite (or favorite group) points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FavoriteKind {
	#[default]
	Friend,
	#[serde(alias = "vrcPlusWorld")]
	World,
	Avatar,
}

impl FavoriteKind {
	pub const ALL: [FavoriteKind; 3] = [FavoriteKind::Friend, FavoriteKind::World, FavoriteKind::Avatar];

	pub const fn as_str(self) -> &'static str {
		match self {
			FavoriteKind::Friend => "friend",
			FavoriteKind::World => "world",
			FavoriteKind::Avatar => "avatar",
		}
	}
}

impl fmt::Display for FavoriteKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for FavoriteKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"friend" => Ok(FavoriteKind::Friend),
			"world" | "vrcplusworld" => Ok(FavoriteKind::World),
			"avatar" => Ok(FavoriteKind::Avatar),
			other => Err(ParseIdError::UnknownFavoriteKind(other.to_string())),
		}
	}
}

/// Composite `type:tag` key shared by favorites and favorite group slots.
pub fn group_key(kind: FavoriteKind, tag: &str) -> String {
	format!("{}:{}", kind.as_str(), tag)
}

/// Parsed instance location (`wrld_x:12345~private(usr_y)~region(eu)`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
	pub tag: String,
	pub world_id: Option<String>,
	pub instance_id: Option<String>,
	pub is_offline: bool,
	pub is_private: bool,
	pub is_traveling: bool,
}

impl Location {
	pub const OFFLINE: &'static str = "offline";
	pub const PRIVATE: &'static str = "private";
	pub const TRAVELING: &'static str = "traveling";

	/// Parse a location tag. Empty and special tags never fail.
	pub fn parse(tag: &str) -> Self {
		let tag = tag.trim();
		let mut loc = Location {
			tag: tag.to_string(),
			..Location::default()
		};

		match tag {
			"" | Self::OFFLINE | "offline:offline" => {
				loc.is_offline = true;
			}
			Self::PRIVATE | "private:private" => {
				loc.is_private = true;
			}
			Self::TRAVELING | "traveling:traveling" => {
				loc.is_traveling = true;
			}
			_ => match tag.split_once(':') {
				Some((world, instance)) => {
					loc.world_id = Some(world.to_string());
					loc.instance_id = Some(instance.to_string());
				}
				None => {
					loc.world_id = Some(tag.to_string());
				}
			},
		}

		loc
	}

	/// True when the tag names a joinable/visible world instance.
	pub fn is_real_instance(&self) -> bool {
		!self.is_offline && !self.is_private && !self.is_traveling && self.instance_id.is_some()
	}
}

impl fmt::Display for Location {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.tag)
	}
}
