#![forbid(unsafe_code)]

use std::collections::VecDeque;

use tether_domain::FriendState;

/// Ordered friend list a context lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
	VipOnline,
	Online,
	Active,
	Offline,
}

impl Bucket {
	pub fn for_state(state: FriendState, is_vip: bool) -> Self {
		match state {
			FriendState::Online if is_vip => Bucket::VipOnline,
			FriendState::Online => Bucket::Online,
			FriendState::Active => Bucket::Active,
			FriendState::Offline => Bucket::Offline,
		}
	}

	fn is_offline(self) -> bool {
		self == Bucket::Offline
	}
}

/// `(lowercased display name, id)`; ids break name ties.
type SortKey = (String, String);

/// State buckets sorted by name plus the two recency lists.
#[derive(Debug, Default)]
pub(super) struct Buckets {
	vip_online: Vec<SortKey>,
	online: Vec<SortKey>,
	active: Vec<SortKey>,
	offline: Vec<SortKey>,
	/// Online and active friends, most recent change first.
	recent_online: VecDeque<String>,
	recent_offline: VecDeque<String>,
}

impl Buckets {
	fn list(&self, bucket: Bucket) -> &Vec<SortKey> {
		match bucket {
			Bucket::VipOnline => &self.vip_online,
			Bucket::Online => &self.online,
			Bucket::Active => &self.active,
			Bucket::Offline => &self.offline,
		}
	}

	fn list_mut(&mut self, bucket: Bucket) -> &mut Vec<SortKey> {
		match bucket {
			Bucket::VipOnline => &mut self.vip_online,
			Bucket::Online => &mut self.online,
			Bucket::Active => &mut self.active,
			Bucket::Offline => &mut self.offline,
		}
	}

	fn find(&self, id: &str) -> Option<Bucket> {
		[Bucket::VipOnline, Bucket::Online, Bucket::Active, Bucket::Offline]
			.into_iter()
			.find(|b| self.list(*b).iter().any(|(_, i)| i == id))
	}

	fn insert_sorted(&mut self, bucket: Bucket, id: &str, name: &str) {
		let key = (name.to_lowercase(), id.to_string());
		let list = self.list_mut(bucket);
		let at = list.binary_search(&key).unwrap_or_else(|i| i);
		list.insert(at, key);
	}

	fn remove_sorted(&mut self, id: &str) -> Option<Bucket> {
		let bucket = self.find(id)?;
		self.list_mut(bucket).retain(|(_, i)| i != id);
		Some(bucket)
	}

	/// Move `id` after a state change; it becomes the most recent entry of its recency list.
	pub(super) fn place(&mut self, id: &str, name: &str, bucket: Bucket) {
		self.remove_sorted(id);
		self.insert_sorted(bucket, id, name);

		self.recent_online.retain(|i| i != id);
		self.recent_offline.retain(|i| i != id);
		if bucket.is_offline() {
			self.recent_offline.push_front(id.to_string());
		} else {
			self.recent_online.push_front(id.to_string());
		}
	}

	/// Re-sort `id` after a rename or VIP change without touching recency, unless the
	/// context was not placed yet.
	pub(super) fn reposition(&mut self, id: &str, name: &str, bucket: Bucket) {
		match self.remove_sorted(id) {
			Some(previous) if previous.is_offline() == bucket.is_offline() => self.insert_sorted(bucket, id, name),
			_ => self.place(id, name, bucket),
		}
	}

	pub(super) fn remove(&mut self, id: &str) {
		self.remove_sorted(id);
		self.recent_online.retain(|i| i != id);
		self.recent_offline.retain(|i| i != id);
	}

	pub(super) fn ids(&self, bucket: Bucket) -> Vec<String> {
		self.list(bucket).iter().map(|(_, id)| id.clone()).collect()
	}

	pub(super) fn recent_online(&self) -> Vec<String> {
		self.recent_online.iter().cloned().collect()
	}

	pub(super) fn recent_offline(&self) -> Vec<String> {
		self.recent_offline.iter().cloned().collect()
	}

	pub(super) fn bucket_of(&self, id: &str) -> Option<Bucket> {
		self.find(id)
	}

	pub(super) fn clear(&mut self) {
		*self = Self::default();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn buckets_sort_case_insensitively() {
		let mut b = Buckets::default();
		b.place("usr_1", "bob", Bucket::Online);
		b.place("usr_2", "Alice", Bucket::Online);
		b.place("usr_3", "carol", Bucket::Online);
		assert_eq!(b.ids(Bucket::Online), vec!["usr_2", "usr_1", "usr_3"]);
		assert_eq!(b.recent_online(), vec!["usr_3", "usr_2", "usr_1"]);
	}

	#[test]
	fn each_id_is_in_exactly_one_bucket() {
		let mut b = Buckets::default();
		b.place("usr_1", "a", Bucket::Online);
		b.place("usr_1", "a", Bucket::Offline);
		assert!(b.ids(Bucket::Online).is_empty());
		assert_eq!(b.ids(Bucket::Offline), vec!["usr_1"]);
		assert!(b.recent_online().is_empty());
		assert_eq!(b.recent_offline(), vec!["usr_1"]);
	}

	#[test]
	fn reposition_keeps_recency_order() {
		let mut b = Buckets::default();
		b.place("usr_1", "a", Bucket::Online);
		b.place("usr_2", "b", Bucket::Online);
		b.reposition("usr_1", "a", Bucket::VipOnline);
		assert_eq!(b.bucket_of("usr_1"), Some(Bucket::VipOnline));
		assert_eq!(b.recent_online(), vec!["usr_2", "usr_1"]);
	}
}
