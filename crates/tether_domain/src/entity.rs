#![forbid(unsafe_code)]

use core::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::EntityKind;

/// One server attribute that differs between two snapshots of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
	pub field: &'static str,
	pub before: Value,
	pub after: Value,
}

/// Attribute-level diff between two snapshots of the same record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
	changes: Vec<FieldChange>,
}

impl Patch {
	/// Record a changed field. Values that fail to serialize are reported as `null`.
	pub fn push<T: Serialize>(&mut self, field: &'static str, before: &T, after: &T) {
		self.changes.push(FieldChange {
			field,
			before: serde_json::to_value(before).unwrap_or(Value::Null),
			after: serde_json::to_value(after).unwrap_or(Value::Null),
		});
	}

	pub fn is_empty(&self) -> bool {
		self.changes.is_empty()
	}

	pub fn len(&self) -> usize {
		self.changes.len()
	}

	pub fn contains(&self, field: &str) -> bool {
		self.changes.iter().any(|c| c.field == field)
	}

	pub fn get(&self, field: &str) -> Option<&FieldChange> {
		self.changes.iter().find(|c| c.field == field)
	}

	pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
		self.changes.iter()
	}

	pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
		self.changes.iter().map(|c| c.field)
	}
}

impl fmt::Display for Patch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for change in &self.changes {
			if !first {
				f.write_str(",")?;
			}
			first = false;
			f.write_str(change.field)?;
		}
		Ok(())
	}
}

/// Compare listed fields of two records and collect a [`Patch`].
///
/// Only server attributes belong in the list; local attributes are never diffed.
#[macro_export]
macro_rules! diff_fields {
	($before:expr, $after:expr; $($field:ident => $name:literal),+ $(,)?) => {{
		let mut patch = $crate::Patch::default();
		$(
			if $before.$field != $after.$field {
				patch.push($name, &$before.$field, &$after.$field);
			}
		)+
		patch
	}};
}

/// A server-owned record mirrored in an entity cache.
///
/// Server attributes round-trip through serde; local attributes are `#[serde(skip)]`,
/// carried across merges by [`Entity::inherit_local`] and recomputed by [`Entity::derive`].
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
	const KIND: EntityKind;

	fn id(&self) -> &str;

	/// Optional secondary index key (e.g. the object a favorite points at).
	fn secondary_key(&self) -> Option<&str> {
		None
	}

	/// Server attributes that changed going from `previous` to `self`.
	fn diff(&self, previous: &Self) -> Patch;

	/// Copy local attributes from the snapshot being replaced.
	fn inherit_local(&mut self, _previous: &Self) {}

	/// Recompute derived local attributes from server attributes.
	fn derive(&mut self) {}

	/// Parse a first sighting.
	fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
		let mut record: Self = serde_json::from_value(strip_nulls(payload))?;
		record.derive();
		Ok(record)
	}

	/// Merge a (possibly partial) payload over this record's server attributes.
	///
	/// Keys present in `payload` replace the stored ones; `null` values are ignored.
	fn merged_with(&self, payload: &Value) -> Result<Self, serde_json::Error> {
		let mut base = match serde_json::to_value(self)? {
			Value::Object(map) => map,
			_ => Map::new(),
		};
		if let Value::Object(incoming) = payload {
			for (k, v) in incoming {
				if !v.is_null() {
					base.insert(k.clone(), v.clone());
				}
			}
		}

		let mut record: Self = serde_json::from_value(Value::Object(base))?;
		record.inherit_local(self);
		record.derive();
		Ok(record)
	}
}

fn strip_nulls(payload: &Value) -> Value {
	match payload {
		Value::Object(map) => Value::Object(
			map.iter()
				.filter(|(_, v)| !v.is_null())
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
		),
		other => other.clone(),
	}
}
