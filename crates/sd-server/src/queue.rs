//! Per-connection outbound queue with a soft cap.
//!
//! The domain actor enqueues without ever blocking; the connection's
//! socket pump drains. The shared depth gauge is what makes a connection
//! non-receivable: the pump stops pulling requests off the socket while
//! the queue sits at or above [`crate::SOFT_OUT_WIRE_LIMIT`] and resumes
//! once it has drained below it. Generated traffic is enqueued without
//! consulting the cap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::SOFT_OUT_WIRE_LIMIT;

/// Instructions for a connection's socket pump.
#[derive(Debug)]
pub enum Out {
	Frame(Vec<u8>),
	/// Toggle TCP keep-alive on the underlying socket (no-op off TCP).
	SetKeepalive(bool),
	/// Flush whatever is queued ahead and shut the socket down.
	Close,
}

/// Actor-side handle.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
	tx: mpsc::UnboundedSender<Out>,
	depth: Arc<AtomicUsize>,
}

/// Pump-side ends.
#[derive(Debug)]
pub struct OutboundRx {
	pub rx: mpsc::UnboundedReceiver<Out>,
	pub depth: Arc<AtomicUsize>,
}

#[must_use]
pub fn outbound() -> (OutboundQueue, OutboundRx) {
	let (tx, rx) = mpsc::unbounded_channel();
	let depth = Arc::new(AtomicUsize::new(0));
	(
		OutboundQueue {
			tx,
			depth: Arc::clone(&depth),
		},
		OutboundRx { rx, depth },
	)
}

impl OutboundQueue {
	/// Queue one wire message. Never blocks and never fails; a dead pump
	/// means the connection is already on its way down and the message
	/// is simply dropped.
	pub fn send_frame(&self, frame: Vec<u8>) {
		self.depth.fetch_add(1, Ordering::Relaxed);
		if self.tx.send(Out::Frame(frame)).is_err() {
			self.depth.fetch_sub(1, Ordering::Relaxed);
		}
	}

	pub fn set_keepalive(&self, on: bool) {
		let _ = self.tx.send(Out::SetKeepalive(on));
	}

	pub fn close(&self) {
		let _ = self.tx.send(Out::Close);
	}

	#[must_use]
	pub fn depth(&self) -> usize {
		self.depth.load(Ordering::Relaxed)
	}
}

impl OutboundRx {
	/// One frame has left the queue.
	pub fn mark_sent(&self) {
		self.depth.fetch_sub(1, Ordering::Relaxed);
	}

	/// Whether the server should keep reading requests from the peer.
	#[must_use]
	pub fn receivable(&self) -> bool {
		self.depth.load(Ordering::Relaxed) < SOFT_OUT_WIRE_LIMIT
	}
}
