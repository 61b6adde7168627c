//! A timer wheel: a deadline-ordered queue of pending timers.
//!
//! The backing store is a sorted `VecDeque` with binary-search insertion.
//! Appending a timer later than everything already queued is O(1), which
//! matters because that is the overwhelmingly common case (TTLs and idle
//! deadlines mostly arrive in order). The owner drives the wheel: it asks
//! for [`TimerWheel::next_timeout`], sleeps, then calls
//! [`TimerWheel::process`] and dispatches whatever payloads come back.

use std::collections::VecDeque;
use std::time::Instant;

/// Handle for a queued timer, returned by [`TimerWheel::add`] and consumed
/// by [`TimerWheel::remove`]. Removing a timer that has already fired (or
/// was already removed) is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
	id: u64,
	deadline: Instant,
}

impl TimerHandle {
	#[must_use]
	pub fn deadline(&self) -> Instant {
		self.deadline
	}
}

#[derive(Debug)]
struct Entry<T> {
	deadline: Instant,
	id: u64,
	payload: T,
}

#[derive(Debug)]
pub struct TimerWheel<T> {
	entries: VecDeque<Entry<T>>,
	next_id: u64,
}

impl<T> Default for TimerWheel<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> TimerWheel<T> {
	#[must_use]
	pub fn new() -> Self {
		TimerWheel {
			entries: VecDeque::new(),
			next_id: 0,
		}
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Queue `payload` to fire at `deadline`.
	pub fn add(&mut self, payload: T, deadline: Instant) -> TimerHandle {
		let id = self.next_id;
		self.next_id += 1;

		let idx = self.insertion_idx(deadline);
		self.entries.insert(idx, Entry { deadline, id, payload });

		TimerHandle { id, deadline }
	}

	/// Cancel a pending timer. Returns the payload if the timer was still
	/// queued. The handle's recorded deadline narrows the search to a
	/// binary-search plus a scan over equal deadlines.
	pub fn remove(&mut self, handle: TimerHandle) -> Option<T> {
		let mut idx = self.entries.partition_point(|e| e.deadline < handle.deadline);
		while let Some(entry) = self.entries.get(idx) {
			if entry.deadline != handle.deadline {
				return None;
			}
			if entry.id == handle.id {
				return self.entries.remove(idx).map(|e| e.payload);
			}
			idx += 1;
		}
		None
	}

	/// The earliest pending deadline, if any.
	#[must_use]
	pub fn next_timeout(&self) -> Option<Instant> {
		self.entries.front().map(|e| e.deadline)
	}

	/// Pop every entry with deadline <= `now`, in deadline order. The
	/// caller dispatches the returned payloads; dispatching may freely add
	/// or remove timers on the wheel.
	pub fn process(&mut self, now: Instant) -> Vec<T> {
		let mut due = Vec::new();
		while let Some(front) = self.entries.front() {
			if front.deadline > now {
				break;
			}
			if let Some(entry) = self.entries.pop_front() {
				due.push(entry.payload);
			}
		}
		due
	}

	fn insertion_idx(&self, deadline: Instant) -> usize {
		// Fast path: later than (or equal to) everything queued.
		match self.entries.back() {
			None => 0,
			Some(last) if deadline >= last.deadline => self.entries.len(),
			_ => self.entries.partition_point(|e| e.deadline <= deadline),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn base() -> Instant {
		Instant::now()
	}

	fn at(base: Instant, ms: u64) -> Instant {
		base + Duration::from_millis(ms)
	}

	#[test]
	fn fires_in_deadline_order() {
		let t0 = base();
		let mut wheel = TimerWheel::new();
		wheel.add("c", at(t0, 30));
		wheel.add("a", at(t0, 10));
		wheel.add("b", at(t0, 20));

		assert_eq!(wheel.next_timeout(), Some(at(t0, 10)));
		assert_eq!(wheel.process(at(t0, 25)), vec!["a", "b"]);
		assert_eq!(wheel.next_timeout(), Some(at(t0, 30)));
		assert_eq!(wheel.process(at(t0, 30)), vec!["c"]);
		assert!(wheel.is_empty());
	}

	#[test]
	fn process_with_nothing_due() {
		let t0 = base();
		let mut wheel = TimerWheel::new();
		wheel.add(1, at(t0, 100));
		assert!(wheel.process(t0).is_empty());
		assert_eq!(wheel.len(), 1);
	}

	#[test]
	fn empty_wheel_has_no_timeout() {
		let wheel: TimerWheel<()> = TimerWheel::new();
		assert_eq!(wheel.next_timeout(), None);
	}

	#[test]
	fn remove_cancels() {
		let t0 = base();
		let mut wheel = TimerWheel::new();
		let keep = wheel.add("keep", at(t0, 10));
		let cancel = wheel.add("cancel", at(t0, 20));

		assert_eq!(wheel.remove(cancel), Some("cancel"));
		assert_eq!(wheel.process(at(t0, 30)), vec!["keep"]);
		let _ = keep;
	}

	#[test]
	fn remove_after_fire_is_a_noop() {
		let t0 = base();
		let mut wheel = TimerWheel::new();
		let handle = wheel.add("x", at(t0, 5));
		assert_eq!(wheel.process(at(t0, 5)), vec!["x"]);
		assert_eq!(wheel.remove(handle), None);
		assert_eq!(wheel.remove(handle), None);
	}

	#[test]
	fn remove_among_equal_deadlines() {
		let t0 = base();
		let mut wheel = TimerWheel::new();
		let deadline = at(t0, 10);
		let a = wheel.add("a", deadline);
		let b = wheel.add("b", deadline);
		let c = wheel.add("c", deadline);

		assert_eq!(wheel.remove(b), Some("b"));
		assert_eq!(wheel.process(deadline), vec!["a", "c"]);
		let _ = (a, c);
	}

	#[test]
	fn equal_deadlines_fire_in_insertion_order() {
		let t0 = base();
		let mut wheel = TimerWheel::new();
		let deadline = at(t0, 10);
		wheel.add(1, deadline);
		wheel.add(2, deadline);
		wheel.add(3, deadline);
		assert_eq!(wheel.process(deadline), vec![1, 2, 3]);
	}

	#[test]
	fn interleaved_add_remove_keeps_order() {
		let t0 = base();
		let mut wheel = TimerWheel::new();
		let mut handles = Vec::new();
		for i in 0..100u64 {
			// deliberately out of order
			let ms = (i * 37) % 100;
			handles.push(wheel.add(ms, at(t0, ms)));
		}
		for handle in handles.iter().step_by(3) {
			wheel.remove(*handle);
		}
		let fired = wheel.process(at(t0, 100));
		let mut sorted = fired.clone();
		sorted.sort_unstable();
		assert_eq!(fired, sorted);
	}
}
