use sd_proto::{MatchType, Props};

use crate::entities::{ServiceState, Subscription};
use crate::{ClientId, ServiceId, SubscriptionId};

/// The service fields a match notification carries. Absent on
/// DISAPPEARED, which only names the service id.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
	pub generation: u64,
	pub props: Props,
	pub ttl: u64,
	pub client_id: ClientId,
	pub orphan_since: Option<f64>,
}

impl ServiceSnapshot {
	pub(crate) fn of(state: &ServiceState) -> Self {
		ServiceSnapshot {
			generation: state.generation,
			props: state.props.clone(),
			ttl: state.ttl,
			client_id: state.owner,
			orphan_since: state.orphan_since,
		}
	}
}

/// One notification owed to one subscription as the result of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
	pub sub_id: SubscriptionId,
	/// Client owning the subscription; the server routes the notification
	/// to this client's active connection.
	pub subscriber: ClientId,
	pub match_type: MatchType,
	pub service_id: ServiceId,
	pub service: Option<ServiceSnapshot>,
}

/// A committed change to a single service.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Change<'a> {
	Added { after: &'a ServiceState },
	Modified { before: &'a ServiceState, after: &'a ServiceState },
	Removed { before: &'a ServiceState },
}

/// Decide what, if anything, `sub` should hear about `change`. The
/// transition is determined by comparing the filter match before and
/// after: newly matching is APPEARED, no longer matching is DISAPPEARED,
/// still matching is MODIFIED, never matching is silence.
pub(crate) fn notify(sub: &Subscription, service_id: ServiceId, change: Change<'_>) -> Option<MatchEvent> {
	let (match_type, state) = match change {
		Change::Added { after } => {
			if !sub.matches(&after.props) {
				return None;
			}
			(MatchType::Appeared, Some(after))
		}
		Change::Modified { before, after } => {
			let matched = sub.matches(&before.props);
			let matches = sub.matches(&after.props);
			match (matched, matches) {
				(true, true) => (MatchType::Modified, Some(after)),
				(false, true) => (MatchType::Appeared, Some(after)),
				(true, false) => (MatchType::Disappeared, None),
				(false, false) => return None,
			}
		}
		Change::Removed { before } => {
			if !sub.matches(&before.props) {
				return None;
			}
			(MatchType::Disappeared, None)
		}
	};
	Some(MatchEvent {
		sub_id: sub.sub_id,
		subscriber: sub.owner,
		match_type,
		service_id,
		service: state.map(ServiceSnapshot::of),
	})
}
