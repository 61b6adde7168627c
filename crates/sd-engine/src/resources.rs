//! Per-user and total resource accounting.
//!
//! Every live client, service and subscription is charged against its
//! owning user. Either ledger (the user's or the total) hitting its cap
//! rejects the allocation.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
	Client,
	Service,
	Subscription,
}

impl ResourceKind {
	pub const ALL: [ResourceKind; 3] = [ResourceKind::Client, ResourceKind::Service, ResourceKind::Subscription];

	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			ResourceKind::Client => "clients",
			ResourceKind::Service => "services",
			ResourceKind::Subscription => "subscriptions",
		}
	}

	fn idx(self) -> usize {
		match self {
			ResourceKind::Client => 0,
			ResourceKind::Service => 1,
			ResourceKind::Subscription => 2,
		}
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
	User,
	Total,
}

impl fmt::Display for ResourceScope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ResourceScope::User => "user",
			ResourceScope::Total => "total",
		})
	}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("insufficient resources: {scope} {kind} limit reached")]
pub struct ResourceError {
	pub scope: ResourceScope,
	pub kind: ResourceKind,
}

/// Optional caps for each resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Limits {
	pub clients: Option<u64>,
	pub services: Option<u64>,
	pub subscriptions: Option<u64>,
}

impl Limits {
	#[must_use]
	pub fn cap(&self, kind: ResourceKind) -> Option<u64> {
		match kind {
			ResourceKind::Client => self.clients,
			ResourceKind::Service => self.services,
			ResourceKind::Subscription => self.subscriptions,
		}
	}

	#[must_use]
	pub fn has_limits(&self) -> bool {
		ResourceKind::ALL.iter().any(|kind| self.cap(*kind).is_some())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts([u64; 3]);

impl Counts {
	fn get(&self, kind: ResourceKind) -> u64 {
		self.0[kind.idx()]
	}

	fn bump(&mut self, kind: ResourceKind) {
		self.0[kind.idx()] += 1;
	}

	fn drop_one(&mut self, kind: ResourceKind) {
		debug_assert!(self.0[kind.idx()] > 0, "deallocating {kind} below zero");
		self.0[kind.idx()] = self.0[kind.idx()].saturating_sub(1);
	}

	fn is_zero(&self) -> bool {
		self.0.iter().all(|&n| n == 0)
	}
}

#[derive(Debug, Default)]
pub struct Accountant {
	user_caps: Limits,
	total_caps: Limits,
	users: HashMap<UserId, Counts>,
	total: Counts,
}

impl Accountant {
	#[must_use]
	pub fn new(user_caps: Limits, total_caps: Limits) -> Self {
		Accountant {
			user_caps,
			total_caps,
			users: HashMap::new(),
			total: Counts::default(),
		}
	}

	/// Charge one `kind` entity to `user`. Fails without side effects if
	/// the user's or the total cap would be exceeded.
	pub fn allocate(&mut self, user: &str, kind: ResourceKind) -> Result<(), ResourceError> {
		let user_count = self.users.get(user).map_or(0, |c| c.get(kind));
		if matches!(self.user_caps.cap(kind), Some(cap) if user_count >= cap) {
			return Err(ResourceError {
				scope: ResourceScope::User,
				kind,
			});
		}
		if matches!(self.total_caps.cap(kind), Some(cap) if self.total.get(kind) >= cap) {
			return Err(ResourceError {
				scope: ResourceScope::Total,
				kind,
			});
		}
		self.users.entry(user.to_owned()).or_default().bump(kind);
		self.total.bump(kind);
		Ok(())
	}

	/// Return one `kind` entity charged to `user`. Never fails; a user's
	/// ledger entry is reclaimed when all its counts reach zero.
	pub fn deallocate(&mut self, user: &str, kind: ResourceKind) {
		if let Some(counts) = self.users.get_mut(user) {
			counts.drop_one(kind);
			if counts.is_zero() {
				self.users.remove(user);
			}
		}
		self.total.drop_one(kind);
	}

	/// Move one `kind` entity from `from` to `to`. Deallocates first so
	/// that the move cannot spuriously trip the total cap; on failure the
	/// original allocation is restored.
	pub fn transfer(&mut self, from: &str, to: &str, kind: ResourceKind) -> Result<(), ResourceError> {
		if from == to {
			return Ok(());
		}
		self.deallocate(from, kind);
		if let Err(err) = self.allocate(to, kind) {
			self.users.entry(from.to_owned()).or_default().bump(kind);
			self.total.bump(kind);
			return Err(err);
		}
		Ok(())
	}

	#[must_use]
	pub fn total_count(&self, kind: ResourceKind) -> u64 {
		self.total.get(kind)
	}

	#[must_use]
	pub fn user_count(&self, user: &str, kind: ResourceKind) -> u64 {
		self.users.get(user).map_or(0, |c| c.get(kind))
	}

	/// Sum of the per-user ledgers, for invariant checking.
	#[must_use]
	pub fn user_sum(&self, kind: ResourceKind) -> u64 {
		self.users.values().map(|c| c.get(kind)).sum()
	}

	#[must_use]
	pub fn total_caps(&self) -> &Limits {
		&self.total_caps
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limited(clients: Option<u64>, services: Option<u64>, subscriptions: Option<u64>) -> Limits {
		Limits {
			clients,
			services,
			subscriptions,
		}
	}

	#[test]
	fn user_cap_is_enforced() {
		let mut acc = Accountant::new(limited(None, Some(2), None), Limits::default());
		acc.allocate("u0", ResourceKind::Service).unwrap();
		acc.allocate("u0", ResourceKind::Service).unwrap();
		let err = acc.allocate("u0", ResourceKind::Service).unwrap_err();
		assert_eq!(err.scope, ResourceScope::User);
		// another user is unaffected
		acc.allocate("u1", ResourceKind::Service).unwrap();
	}

	#[test]
	fn total_cap_is_enforced_across_users() {
		let mut acc = Accountant::new(Limits::default(), limited(None, Some(2), None));
		acc.allocate("u0", ResourceKind::Service).unwrap();
		acc.allocate("u1", ResourceKind::Service).unwrap();
		let err = acc.allocate("u2", ResourceKind::Service).unwrap_err();
		assert_eq!(err.scope, ResourceScope::Total);
	}

	#[test]
	fn deallocate_frees_capacity() {
		let mut acc = Accountant::new(limited(None, Some(1), None), Limits::default());
		acc.allocate("u0", ResourceKind::Service).unwrap();
		assert!(acc.allocate("u0", ResourceKind::Service).is_err());
		acc.deallocate("u0", ResourceKind::Service);
		acc.allocate("u0", ResourceKind::Service).unwrap();
	}

	#[test]
	fn zeroed_users_are_reclaimed() {
		let mut acc = Accountant::new(Limits::default(), Limits::default());
		acc.allocate("u0", ResourceKind::Client).unwrap();
		acc.deallocate("u0", ResourceKind::Client);
		assert!(acc.users.is_empty());
		assert_eq!(acc.total_count(ResourceKind::Client), 0);
	}

	#[test]
	fn transfer_moves_between_users() {
		let mut acc = Accountant::new(limited(None, Some(1), None), Limits::default());
		acc.allocate("u0", ResourceKind::Service).unwrap();
		acc.transfer("u0", "u1", ResourceKind::Service).unwrap();
		assert_eq!(acc.user_count("u0", ResourceKind::Service), 0);
		assert_eq!(acc.user_count("u1", ResourceKind::Service), 1);
		assert_eq!(acc.total_count(ResourceKind::Service), 1);
	}

	#[test]
	fn transfer_does_not_trip_the_total_cap() {
		// with one service live and total cap 1, a transfer must succeed
		let mut acc = Accountant::new(Limits::default(), limited(None, Some(1), None));
		acc.allocate("u0", ResourceKind::Service).unwrap();
		acc.transfer("u0", "u1", ResourceKind::Service).unwrap();
		assert_eq!(acc.total_count(ResourceKind::Service), 1);
	}

	#[test]
	fn failed_transfer_restores_the_source() {
		let mut acc = Accountant::new(limited(None, Some(1), None), Limits::default());
		acc.allocate("u0", ResourceKind::Service).unwrap();
		acc.allocate("u1", ResourceKind::Service).unwrap();
		let err = acc.transfer("u0", "u1", ResourceKind::Service).unwrap_err();
		assert_eq!(err.scope, ResourceScope::User);
		assert_eq!(acc.user_count("u0", ResourceKind::Service), 1);
		assert_eq!(acc.user_count("u1", ResourceKind::Service), 1);
	}

	#[test]
	fn user_sum_equals_total() {
		let mut acc = Accountant::new(Limits::default(), Limits::default());
		for user in ["a", "b", "c"] {
			acc.allocate(user, ResourceKind::Client).unwrap();
			acc.allocate(user, ResourceKind::Service).unwrap();
			acc.allocate(user, ResourceKind::Service).unwrap();
		}
		acc.deallocate("b", ResourceKind::Service);
		for kind in ResourceKind::ALL {
			assert_eq!(acc.user_sum(kind), acc.total_count(kind));
		}
	}
}
