//! Listeners and per-connection socket pumps.
//!
//! The transport gives the protocol layer framed, ordered messages over
//! TCP, TLS or abstract unix-domain sockets; framing is length-delimited
//! ([`LengthDelimitedCodec`]). Each accepted connection runs one pump
//! task that forwards inbound frames to the domain actor and drains the
//! outbound queue, with batching in both directions so one busy peer
//! cannot starve the rest.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info};

use crate::addr::SockAddr;
use crate::config::SocketConf;
use crate::conn::{ConnEvent, NewConn};
use crate::queue::{outbound, Out, OutboundRx};
use crate::tls::{build_acceptor, peer_ski};
use crate::{ServerError, MAX_ACCEPT_BATCH, MAX_RECV_BATCH, MAX_SEND_BATCH};

pub enum IoStream {
	Tcp(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
	Ux(UnixStream),
}

impl AsyncRead for IoStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			IoStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			IoStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
			IoStream::Ux(s) => Pin::new(s).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for IoStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			IoStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
			IoStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
			IoStream::Ux(s) => Pin::new(s).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			IoStream::Tcp(s) => Pin::new(s).poll_flush(cx),
			IoStream::Tls(s) => Pin::new(s).poll_flush(cx),
			IoStream::Ux(s) => Pin::new(s).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			IoStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			IoStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
			IoStream::Ux(s) => Pin::new(s).poll_shutdown(cx),
		}
	}
}

impl IoStream {
	fn set_keepalive(&self, on: bool) {
		let stream = match self {
			IoStream::Tcp(s) => s,
			IoStream::Tls(s) => s.get_ref().0,
			IoStream::Ux(_) => return,
		};
		let sock = socket2::SockRef::from(stream);
		if let Err(e) = sock.set_keepalive(on) {
			debug!("unable to set keep-alive: {e}");
		}
	}
}

enum ListenerKind {
	Tcp(TcpListener),
	Tls(TcpListener, TlsAcceptor),
	Ux(UnixListener, String),
}

pub struct Listener {
	kind: ListenerKind,
	local_addr: String,
}

impl Listener {
	pub async fn bind(socket: &SocketConf) -> Result<Listener, ServerError> {
		let addr_s = socket.addr.to_string();
		match &socket.addr {
			SockAddr::Tcp { host, port } => {
				let listener = bind_tcp(&addr_s, host, *port).await?;
				let local_addr = tcp_local_addr("tcp", &addr_s, &listener)?;
				Ok(Listener {
					kind: ListenerKind::Tcp(listener),
					local_addr,
				})
			}
			SockAddr::Tls { host, port } => {
				let tls_conf = socket.tls.as_ref().ok_or_else(|| ServerError::Tls {
					addr: addr_s.clone(),
					reason: "tls address without tls attributes".to_owned(),
				})?;
				let acceptor = build_acceptor(&addr_s, tls_conf)?;
				let listener = bind_tcp(&addr_s, host, *port).await?;
				let local_addr = tcp_local_addr("tls", &addr_s, &listener)?;
				Ok(Listener {
					kind: ListenerKind::Tls(listener, acceptor),
					local_addr,
				})
			}
			SockAddr::Ux { name } => {
				let listener = bind_abstract_ux(&addr_s, name)?;
				Ok(Listener {
					kind: ListenerKind::Ux(listener, name.clone()),
					local_addr: addr_s,
				})
			}
		}
	}

	/// The bound address in `scheme:...` form, with any wildcard port
	/// resolved.
	#[must_use]
	pub fn local_addr(&self) -> &str {
		&self.local_addr
	}
}

async fn bind_tcp(addr: &str, host: &str, port: u16) -> Result<TcpListener, ServerError> {
	let host = if host == "*" { "0.0.0.0" } else { host };
	TcpListener::bind((host, port)).await.map_err(|source| ServerError::Listen {
		addr: addr.to_owned(),
		source,
	})
}

fn tcp_local_addr(scheme: &str, addr: &str, listener: &TcpListener) -> Result<String, ServerError> {
	let local = listener.local_addr().map_err(|source| ServerError::Listen {
		addr: addr.to_owned(),
		source,
	})?;
	Ok(format!("{scheme}:{}:{}", local.ip(), local.port()))
}

fn bind_abstract_ux(addr: &str, name: &str) -> Result<UnixListener, ServerError> {
	use std::os::linux::net::SocketAddrExt;

	let listen = || -> std::io::Result<UnixListener> {
		let sock_addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
		let listener = std::os::unix::net::UnixListener::bind_addr(&sock_addr)?;
		listener.set_nonblocking(true)?;
		UnixListener::from_std(listener)
	};
	listen().map_err(|source| ServerError::Listen {
		addr: addr.to_owned(),
		source,
	})
}

/// Accept connections until shutdown, spawning one pump task each.
/// Accepting pauses while `accepting` is false (client admission limit
/// reached).
pub async fn accept_loop(
	listener: Listener, events: mpsc::UnboundedSender<ConnEvent>, conn_ids: Arc<AtomicU64>, mut accepting: watch::Receiver<bool>,
	mut shutdown: watch::Receiver<bool>,
) {
	info!("Serving on {}.", listener.local_addr());
	loop {
		while !*accepting.borrow() {
			tokio::select! {
				_ = shutdown.changed() => return,
				changed = accepting.changed() => {
					if changed.is_err() {
						return;
					}
				}
			}
		}

		tokio::select! {
			_ = shutdown.changed() => return,
			() = accept_batch(&listener, &events, &conn_ids) => {}
		}
	}
}

async fn accept_batch(listener: &Listener, events: &mpsc::UnboundedSender<ConnEvent>, conn_ids: &Arc<AtomicU64>) {
	match &listener.kind {
		ListenerKind::Tcp(l) => {
			let Ok((stream, peer)) = l.accept().await else { return };
			spawn_tcp_conn(stream, peer, None, events, conn_ids);
			for _ in 1..MAX_ACCEPT_BATCH {
				match l.accept().now_or_never() {
					Some(Ok((stream, peer))) => spawn_tcp_conn(stream, peer, None, events, conn_ids),
					_ => break,
				}
			}
		}
		ListenerKind::Tls(l, acceptor) => {
			let Ok((stream, peer)) = l.accept().await else { return };
			spawn_tcp_conn(stream, peer, Some(acceptor.clone()), events, conn_ids);
			for _ in 1..MAX_ACCEPT_BATCH {
				match l.accept().now_or_never() {
					Some(Ok((stream, peer))) => spawn_tcp_conn(stream, peer, Some(acceptor.clone()), events, conn_ids),
					_ => break,
				}
			}
		}
		ListenerKind::Ux(l, name) => {
			let Ok((stream, _)) = l.accept().await else { return };
			spawn_ux_conn(stream, name, events, conn_ids);
			for _ in 1..MAX_ACCEPT_BATCH {
				match l.accept().now_or_never() {
					Some(Ok((stream, _))) => spawn_ux_conn(stream, name, events, conn_ids),
					_ => break,
				}
			}
		}
	}
}

fn next_conn_id(conn_ids: &Arc<AtomicU64>) -> u64 {
	conn_ids.fetch_add(1, Ordering::Relaxed)
}

fn spawn_tcp_conn(
	stream: TcpStream, peer: std::net::SocketAddr, acceptor: Option<TlsAcceptor>, events: &mpsc::UnboundedSender<ConnEvent>, conn_ids: &Arc<AtomicU64>,
) {
	let conn_id = next_conn_id(conn_ids);
	let events = events.clone();
	tokio::spawn(async move {
		let _ = stream.set_nodelay(true);
		let (io, addr, ski) = match acceptor {
			None => (IoStream::Tcp(stream), format!("tcp:{}:{}", peer.ip(), peer.port()), None),
			Some(acceptor) => match acceptor.accept(stream).await {
				Ok(tls) => {
					let ski = peer_ski(tls.get_ref().1.peer_certificates());
					(IoStream::Tls(Box::new(tls)), format!("tls:{}:{}", peer.ip(), peer.port()), ski)
				}
				Err(e) => {
					debug!("TLS handshake with {peer} failed: {e}");
					return;
				}
			},
		};
		// the v2 keep-alive default; a v3 handshake turns it off
		io.set_keepalive(true);
		pump(conn_id, io, addr, ski, true, events).await;
	});
}

fn spawn_ux_conn(stream: UnixStream, name: &str, events: &mpsc::UnboundedSender<ConnEvent>, conn_ids: &Arc<AtomicU64>) {
	let conn_id = next_conn_id(conn_ids);
	let addr = format!("ux:{name}");
	let events = events.clone();
	tokio::spawn(async move {
		pump(conn_id, IoStream::Ux(stream), addr, None, false, events).await;
	});
}

/// The per-connection socket pump: registers the connection with the
/// actor, then moves frames until either side goes away.
async fn pump(conn_id: u64, io: IoStream, addr: String, ski: Option<String>, is_tcp: bool, events: mpsc::UnboundedSender<ConnEvent>) {
	let (queue, out_rx) = outbound();
	if events
		.send(ConnEvent::Accepted(NewConn {
			conn_id,
			addr,
			ski,
			is_tcp,
			queue,
		}))
		.is_err()
	{
		return;
	}

	let mut framed = Framed::new(io, LengthDelimitedCodec::new());
	let OutboundRx { mut rx, depth } = out_rx;

	let mut recv_budget = MAX_RECV_BATCH;
	loop {
		let receivable = depth.load(Ordering::Relaxed) < crate::SOFT_OUT_WIRE_LIMIT;
		tokio::select! {
			biased;

			out = rx.recv() => {
				match out {
					Some(Out::Frame(frame)) => {
						match send_batch(&mut framed, &depth, frame, &mut rx).await {
							Ok(true) => {}
							Ok(false) => return,
							Err(_) => {
								let _ = events.send(ConnEvent::Closed { conn_id, reason: "error on socket send".to_owned() });
								return;
							}
						}
					}
					Some(Out::SetKeepalive(on)) => framed.get_ref().set_keepalive(on),
					Some(Out::Close) | None => {
						let _ = framed.flush().await;
						return;
					}
				}
			}

			frame = framed.next(), if receivable => {
				match frame {
					Some(Ok(frame)) => {
						if events.send(ConnEvent::Frame { conn_id, frame: frame.to_vec() }).is_err() {
							return;
						}
						recv_budget -= 1;
						if recv_budget == 0 {
							recv_budget = MAX_RECV_BATCH;
							tokio::task::yield_now().await;
						}
					}
					Some(Err(e)) => {
						let _ = events.send(ConnEvent::Closed { conn_id, reason: format!("error on socket receive: {e}") });
						return;
					}
					None => {
						let _ = events.send(ConnEvent::Closed { conn_id, reason: "connection closed by peer".to_owned() });
						return;
					}
				}
			}
		}
	}
}

/// Write up to [`MAX_SEND_BATCH`] queued frames, then flush once.
/// Returns `Ok(false)` when a close instruction was reached.
async fn send_batch(
	framed: &mut Framed<IoStream, LengthDelimitedCodec>, depth: &Arc<AtomicUsize>, first: Vec<u8>, rx: &mut mpsc::UnboundedReceiver<Out>,
) -> Result<bool, std::io::Error> {
	let mut open = true;
	framed.feed(first.into()).await?;
	depth.fetch_sub(1, Ordering::Relaxed);

	for _ in 1..MAX_SEND_BATCH {
		match rx.try_recv() {
			Ok(Out::Frame(frame)) => {
				framed.feed(frame.into()).await?;
				depth.fetch_sub(1, Ordering::Relaxed);
			}
			Ok(Out::SetKeepalive(on)) => framed.get_ref().set_keepalive(on),
			Ok(Out::Close) => {
				open = false;
				break;
			}
			Err(_) => break,
		}
	}
	framed.flush().await?;
	Ok(open)
}
