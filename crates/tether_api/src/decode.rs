#![forbid(unsafe_code)]

//! Push message decoding: `{"type": .., "content": ..}` envelopes into [`PipelineEvent`]s.

use serde::Deserialize;
use serde_json::Value;
use tether_core::PipelineEvent;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("invalid json envelope: {0}")]
	Json(#[from] serde_json::Error),

	#[error("unknown message type {0:?}")]
	UnknownType(String),

	#[error("{kind}: missing field {field}")]
	MissingField { kind: String, field: &'static str },
}

#[derive(Debug, Deserialize)]
struct Envelope {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	content: Value,
}

/// Decode one text frame.
pub fn decode_message(text: &str) -> Result<PipelineEvent, DecodeError> {
	let Envelope { kind, content } = serde_json::from_str(text)?;

	// Content usually arrives as a JSON document embedded in a string; notification ids
	// arrive as a bare string.
	let content = match content {
		Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
		other => other,
	};

	let ev = match kind.as_str() {
		"friend-add" => PipelineEvent::FriendAdd {
			user_id: user_id(&kind, &content)?,
			user: user(&content),
		},
		"friend-delete" => PipelineEvent::FriendDelete {
			user_id: user_id(&kind, &content)?,
		},
		"friend-online" => PipelineEvent::FriendOnline {
			user_id: user_id(&kind, &content)?,
			user: user(&content),
			location: string(&content, "location"),
			platform: string(&content, "platform"),
		},
		"friend-active" => PipelineEvent::FriendActive {
			user_id: user_id(&kind, &content)?,
			user: user(&content),
		},
		"friend-offline" => PipelineEvent::FriendOffline {
			user_id: user_id(&kind, &content)?,
		},
		"friend-update" => PipelineEvent::FriendUpdate {
			user_id: user_id(&kind, &content)?,
			user: user(&content),
		},
		"friend-location" => PipelineEvent::FriendLocation {
			user_id: user_id(&kind, &content)?,
			user: user(&content),
			location: string(&content, "location"),
			traveling_to_location: string(&content, "travelingToLocation"),
			world_name: content
				.get("world")
				.and_then(|w| w.get("name"))
				.and_then(Value::as_str)
				.map(str::to_string),
		},
		"user-update" => PipelineEvent::UserUpdate {
			user_id: user_id(&kind, &content)?,
			user: user(&content),
		},
		"user-location" => PipelineEvent::UserLocation {
			user_id: user_id(&kind, &content)?,
			location: string(&content, "location"),
		},
		"notification" => {
			if string(&content, "id").is_none() {
				return Err(DecodeError::MissingField { kind, field: "id" });
			}
			PipelineEvent::NotificationAdd(content)
		}
		"see-notification" => PipelineEvent::NotificationSeen {
			id: bare_id(&kind, &content)?,
		},
		"hide-notification" => PipelineEvent::NotificationHidden {
			id: bare_id(&kind, &content)?,
		},
		_ => return Err(DecodeError::UnknownType(kind)),
	};
	Ok(ev)
}

fn string(content: &Value, key: &str) -> Option<String> {
	content
		.get(key)
		.and_then(Value::as_str)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
}

fn user(content: &Value) -> Option<Value> {
	content.get("user").filter(|u| u.is_object()).cloned()
}

fn user_id(kind: &str, content: &Value) -> Result<String, DecodeError> {
	string(content, "userId")
		.or_else(|| content.get("user").and_then(|u| string(u, "id")))
		.ok_or_else(|| DecodeError::MissingField {
			kind: kind.to_string(),
			field: "userId",
		})
}

fn bare_id(kind: &str, content: &Value) -> Result<String, DecodeError> {
	match content {
		Value::String(s) if !s.is_empty() => Ok(s.clone()),
		other => string(other, "id").ok_or_else(|| DecodeError::MissingField {
			kind: kind.to_string(),
			field: "id",
		}),
	}
}
