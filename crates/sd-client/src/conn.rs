use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use sd_proto::fields::{self, ensure_consumed, Obj};
use sd_proto::ta;
use sd_proto::{Envelope, MatchType, MsgType, OutMsg, Props, TrackType};

use crate::domain::{self, ServerSpec};
use crate::{ClientError, ClientInfo, MatchNotification, ServiceInfo, SubscriptionInfo};

enum IoStream {
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

/// A message delivered to the transaction that owns its ta-id.
#[derive(Debug)]
struct TaEvent {
	msg_type: MsgType,
	rest: Obj,
}

#[derive(Debug, Default)]
struct RouteTable {
	routes: HashMap<u64, mpsc::UnboundedSender<TaEvent>>,
	/// Set when the transport is gone; newly opened transactions fail
	/// immediately instead of waiting for replies that cannot come.
	dead: bool,
}

type Routes = Arc<Mutex<RouteTable>>;

fn lock_routes(routes: &Routes) -> MutexGuard<'_, RouteTable> {
	routes.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn reader_task(mut framed: FramedRead<ReadHalf<IoStream>, LengthDelimitedCodec>, routes: Routes) {
	loop {
		let frame = match framed.next().await {
			Some(Ok(frame)) => frame,
			Some(Err(e)) => {
				debug!("error on socket receive: {e}");
				break;
			}
			None => break,
		};
		let env = match Envelope::parse(&frame) {
			Ok(env) => env,
			Err(e) => {
				debug!("server sent malformed message: {e}");
				break;
			}
		};
		let mut table = lock_routes(&routes);
		let stale = match table.routes.get(&env.ta_id) {
			Some(tx) => tx
				.send(TaEvent {
					msg_type: env.msg_type,
					rest: env.rest,
				})
				.is_err(),
			None => false,
		};
		if stale {
			table.routes.remove(&env.ta_id);
		}
	}
	// dropping the senders wakes every pending transaction
	let mut table = lock_routes(&routes);
	table.dead = true;
	table.routes.clear();
}

async fn writer_task(mut framed: FramedWrite<WriteHalf<IoStream>, LengthDelimitedCodec>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
	while let Some(frame) = rx.recv().await {
		if framed.send(frame.into()).await.is_err() {
			break;
		}
	}
}

/// Connection options beyond the defaults: a fixed client id, a
/// narrowed protocol range, a specific local IP to connect from, or a
/// non-default domains directory.
#[derive(Debug, Default, Clone)]
pub struct ConnectOpts {
	pub client_id: Option<u64>,
	pub proto_min: Option<u64>,
	pub proto_max: Option<u64>,
	pub local_ip: Option<IpAddr>,
	pub domains_dir: Option<PathBuf>,
}

/// One client connection to a service discovery server. Constructed
/// connected and handshaked.
pub struct Client {
	client_id: u64,
	proto_version: u64,
	ta_seq: u64,
	to_wire: mpsc::UnboundedSender<Vec<u8>>,
	routes: Routes,
	reader: JoinHandle<()>,
	writer: JoinHandle<()>,
}

impl Drop for Client {
	fn drop(&mut self) {
		self.reader.abort();
		self.writer.abort();
	}
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client")
			.field("client_id", &self.client_id)
			.field("proto_version", &self.proto_version)
			.finish()
	}
}

impl Client {
	/// Connect to a domain name or server address and complete the
	/// handshake with a random client id.
	pub async fn connect(target: &str) -> Result<Client, ClientError> {
		Client::connect_with(target, ConnectOpts::default()).await
	}

	pub async fn connect_with(target: &str, opts: ConnectOpts) -> Result<Client, ClientError> {
		let spec = match &opts.domains_dir {
			Some(dir) => domain::resolve_in(dir, target),
			None => domain::resolve(target),
		};
		let io = connect_transport(&spec, opts.local_ip).await?;

		let (read_half, write_half) = tokio::io::split(io);
		let routes: Routes = Arc::new(Mutex::new(RouteTable::default()));
		let (to_wire, wire_rx) = mpsc::unbounded_channel();
		let reader = tokio::spawn(reader_task(FramedRead::new(read_half, LengthDelimitedCodec::new()), Arc::clone(&routes)));
		let writer = tokio::spawn(writer_task(FramedWrite::new(write_half, LengthDelimitedCodec::new()), wire_rx));

		let mut client = Client {
			client_id: opts.client_id.unwrap_or_else(crate::allocate_client_id),
			proto_version: 0,
			ta_seq: 0,
			to_wire,
			routes,
			reader,
			writer,
		};

		let proto_min = opts.proto_min.or(spec.proto_min).unwrap_or(sd_proto::MIN_VERSION);
		let proto_max = opts.proto_max.or(spec.proto_max).unwrap_or(sd_proto::MAX_VERSION);
		let client_id = client.client_id;
		let mut complete = client
			.call_single(ta::CMD_HELLO, |msg| {
				msg
					.uint(fields::CLIENT_ID, client_id)
					.uint(fields::PROTO_MIN_VERSION, proto_min)
					.uint(fields::PROTO_MAX_VERSION, proto_max)
			})
			.await?;
		let version = fields::PROTO_VERSION.pull(&mut complete)?;
		if version < proto_min || version > proto_max {
			return Err(ClientError::Protocol(format!("server selected unsupported protocol version {version}")));
		}
		client.proto_version = version;
		Ok(client)
	}

	#[must_use]
	pub fn client_id(&self) -> u64 {
		self.client_id
	}

	#[must_use]
	pub fn proto_version(&self) -> u64 {
		self.proto_version
	}

	/// Random id helpers, for picking service and subscription ids.
	#[must_use]
	pub fn service_id(&self) -> u64 {
		crate::random_id()
	}

	#[must_use]
	pub fn subscription_id(&self) -> u64 {
		crate::random_id()
	}

	/// Liveness probe; resolves to the round-trip time.
	pub async fn ping(&mut self) -> Result<Duration, ClientError> {
		let start = Instant::now();
		self.call_single(ta::CMD_PING, |msg| msg).await?;
		Ok(start.elapsed())
	}

	pub async fn publish(&mut self, service_id: u64, generation: u64, props: &Props, ttl: u64) -> Result<(), ClientError> {
		self
			.call_single(ta::CMD_PUBLISH, |msg| {
				msg
					.uint(fields::SERVICE_ID, service_id)
					.uint(fields::GENERATION, generation)
					.props(fields::SERVICE_PROPS, props)
					.uint(fields::TTL, ttl)
			})
			.await?;
		Ok(())
	}

	pub async fn unpublish(&mut self, service_id: u64) -> Result<(), ClientError> {
		self.call_single(ta::CMD_UNPUBLISH, |msg| msg.uint(fields::SERVICE_ID, service_id)).await?;
		Ok(())
	}

	pub async fn unsubscribe(&mut self, sub_id: u64) -> Result<(), ClientError> {
		self.call_single(ta::CMD_UNSUBSCRIBE, |msg| msg.uint(fields::SUBSCRIPTION_ID, sub_id)).await?;
		Ok(())
	}

	/// Open a subscription. The returned stream yields match events
	/// until the subscription is cancelled or the connection goes away.
	pub async fn subscribe(&mut self, sub_id: u64, filter: Option<&str>) -> Result<SubscriptionStream, ClientError> {
		let (ta_id, mut rx) = self.register();
		self.send(OutMsg::new(ta::CMD_SUBSCRIBE, ta_id, MsgType::Request).uint(fields::SUBSCRIPTION_ID, sub_id).opt_str(fields::FILTER, filter))?;

		match rx.recv().await {
			None => {
				self.unregister(ta_id);
				Err(closed())
			}
			Some(ev) => match ev.msg_type {
				MsgType::Accept => Ok(SubscriptionStream {
					sub_id,
					ta_id,
					rx,
					routes: Arc::clone(&self.routes),
				}),
				MsgType::Fail => {
					self.unregister(ta_id);
					Err(fail_error(ev.rest))
				}
				other => {
					self.unregister(ta_id);
					Err(unexpected(ta::CMD_SUBSCRIBE, other))
				}
			},
		}
	}

	pub async fn services(&mut self, filter: Option<&str>) -> Result<Vec<ServiceInfo>, ClientError> {
		let rows = self.call_list(ta::CMD_SERVICES, |msg| msg.opt_str(fields::FILTER, filter)).await?;
		rows.into_iter().map(parse_service).collect()
	}

	pub async fn subscriptions(&mut self) -> Result<Vec<SubscriptionInfo>, ClientError> {
		let rows = self.call_list(ta::CMD_SUBSCRIPTIONS, |msg| msg).await?;
		rows.into_iter().map(parse_subscription).collect()
	}

	pub async fn clients(&mut self) -> Result<Vec<ClientInfo>, ClientError> {
		let rows = self.call_list(ta::CMD_CLIENTS, |msg| msg).await?;
		rows.into_iter().map(parse_client).collect()
	}

	/// Open the track (keep-alive) transaction, protocol version 3 and
	/// later.
	pub async fn track(&mut self) -> Result<TrackHandle, ClientError> {
		let (ta_id, mut rx) = self.register();
		self.send(OutMsg::new(ta::CMD_TRACK, ta_id, MsgType::Request))?;

		match rx.recv().await {
			None => {
				self.unregister(ta_id);
				Err(closed())
			}
			Some(ev) => match ev.msg_type {
				MsgType::Accept => Ok(TrackHandle {
					ta_id,
					rx,
					to_wire: self.to_wire.clone(),
					routes: Arc::clone(&self.routes),
				}),
				MsgType::Fail => {
					self.unregister(ta_id);
					Err(fail_error(ev.rest))
				}
				other => {
					self.unregister(ta_id);
					Err(unexpected(ta::CMD_TRACK, other))
				}
			},
		}
	}

	fn register(&mut self) -> (u64, mpsc::UnboundedReceiver<TaEvent>) {
		let ta_id = self.ta_seq;
		self.ta_seq += 1;
		let (tx, rx) = mpsc::unbounded_channel();
		let mut table = lock_routes(&self.routes);
		if !table.dead {
			table.routes.insert(ta_id, tx);
		}
		// on a dead connection tx drops here, so the receiver reports
		// closure right away
		(ta_id, rx)
	}

	fn unregister(&self, ta_id: u64) {
		lock_routes(&self.routes).routes.remove(&ta_id);
	}

	fn send(&self, msg: OutMsg) -> Result<(), ClientError> {
		self.to_wire.send(msg.into_bytes()).map_err(|_| closed())
	}

	async fn call_single(&mut self, cmd: &str, build: impl FnOnce(OutMsg) -> OutMsg) -> Result<Obj, ClientError> {
		let (ta_id, mut rx) = self.register();
		let result = async {
			self.send(build(OutMsg::new(cmd, ta_id, MsgType::Request)))?;
			match rx.recv().await {
				None => Err(closed()),
				Some(ev) => match ev.msg_type {
					MsgType::Complete => Ok(ev.rest),
					MsgType::Fail => Err(fail_error(ev.rest)),
					other => Err(unexpected(cmd, other)),
				},
			}
		}
		.await;
		self.unregister(ta_id);
		result
	}

	async fn call_list(&mut self, cmd: &str, build: impl FnOnce(OutMsg) -> OutMsg) -> Result<Vec<Obj>, ClientError> {
		let (ta_id, mut rx) = self.register();
		let result = async {
			self.send(build(OutMsg::new(cmd, ta_id, MsgType::Request)))?;
			match rx.recv().await {
				None => return Err(closed()),
				Some(ev) => match ev.msg_type {
					MsgType::Accept => {}
					MsgType::Fail => return Err(fail_error(ev.rest)),
					other => return Err(unexpected(cmd, other)),
				},
			}
			let mut rows = Vec::new();
			loop {
				match rx.recv().await {
					None => return Err(closed()),
					Some(ev) => match ev.msg_type {
						MsgType::Notify => rows.push(ev.rest),
						MsgType::Complete => return Ok(rows),
						MsgType::Fail => return Err(fail_error(ev.rest)),
						other => return Err(unexpected(cmd, other)),
					},
				}
			}
		}
		.await;
		self.unregister(ta_id);
		result
	}
}

/// Receiving side of a subscribe transaction.
pub struct SubscriptionStream {
	pub sub_id: u64,
	ta_id: u64,
	rx: mpsc::UnboundedReceiver<TaEvent>,
	routes: Routes,
}

impl SubscriptionStream {
	/// The next match event; `None` when the subscription was ended by
	/// an unsubscribe.
	pub async fn next(&mut self) -> Result<Option<MatchNotification>, ClientError> {
		match self.rx.recv().await {
			None => Err(closed()),
			Some(ev) => match ev.msg_type {
				MsgType::Notify => parse_match(ev.rest).map(Some),
				MsgType::Complete => Ok(None),
				MsgType::Fail => Err(fail_error(ev.rest)),
				other => Err(unexpected(ta::CMD_SUBSCRIBE, other)),
			},
		}
	}

	/// The next match event, or an error after `wait` without one.
	pub async fn next_within(&mut self, wait: Duration) -> Result<MatchNotification, ClientError> {
		match tokio::time::timeout(wait, self.next()).await {
			Err(_) => Err(ClientError::Protocol("timed out waiting for a match notification".to_owned())),
			Ok(Ok(None)) => Err(ClientError::Protocol("subscription ended".to_owned())),
			Ok(Ok(Some(notification))) => Ok(notification),
			Ok(Err(e)) => Err(e),
		}
	}

	/// True when no further notification arrives within `wait`.
	pub async fn quiet_for(&mut self, wait: Duration) -> bool {
		tokio::time::timeout(wait, self.next()).await.is_err()
	}
}

impl Drop for SubscriptionStream {
	fn drop(&mut self) {
		lock_routes(&self.routes).routes.remove(&self.ta_id);
	}
}

impl std::fmt::Debug for SubscriptionStream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SubscriptionStream")
			.field("sub_id", &self.sub_id)
			.field("ta_id", &self.ta_id)
			.finish()
	}
}

/// Client side of the two-way track transaction. The owner decides when
/// (and whether) to reply to the server's queries.
pub struct TrackHandle {
	ta_id: u64,
	rx: mpsc::UnboundedReceiver<TaEvent>,
	to_wire: mpsc::UnboundedSender<Vec<u8>>,
	routes: Routes,
}

impl TrackHandle {
	/// The next track notification from the server (a liveness query,
	/// or the reply to a query of ours).
	pub async fn next_notify(&mut self) -> Result<TrackType, ClientError> {
		match self.rx.recv().await {
			None => Err(closed()),
			Some(ev) => match ev.msg_type {
				MsgType::Notify => {
					let mut rest = ev.rest;
					let track_type = TrackType::parse(&fields::TRACK_TYPE.pull(&mut rest)?)?;
					ensure_consumed(&rest)?;
					Ok(track_type)
				}
				MsgType::Fail => Err(fail_error(ev.rest)),
				other => Err(unexpected(ta::CMD_TRACK, other)),
			},
		}
	}

	/// Answer a server liveness query.
	pub fn reply(&self) {
		let _ = self
			.to_wire
			.send(OutMsg::new(ta::CMD_TRACK, self.ta_id, MsgType::Inform).str(fields::TRACK_TYPE, TrackType::Reply.as_str()).into_bytes());
	}

	/// Probe the server's liveness; it answers with a reply notify.
	pub fn query(&self) {
		let _ = self
			.to_wire
			.send(OutMsg::new(ta::CMD_TRACK, self.ta_id, MsgType::Inform).str(fields::TRACK_TYPE, TrackType::Query.as_str()).into_bytes());
	}

	/// Keep the connection alive unattended: answer every query until
	/// the connection goes away.
	pub fn auto_reply(mut self) -> JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				match self.next_notify().await {
					Ok(TrackType::Query) => self.reply(),
					Ok(TrackType::Reply) => {}
					Err(_) => break,
				}
			}
		})
	}
}

impl Drop for TrackHandle {
	fn drop(&mut self) {
		lock_routes(&self.routes).routes.remove(&self.ta_id);
	}
}

impl std::fmt::Debug for TrackHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TrackHandle").field("ta_id", &self.ta_id).finish()
	}
}

fn closed() -> ClientError {
	ClientError::Transport("connection closed".to_owned())
}

fn unexpected(cmd: &str, msg_type: MsgType) -> ClientError {
	ClientError::Protocol(format!("unexpected {msg_type} message in {cmd} transaction"))
}

fn fail_error(mut rest: Obj) -> ClientError {
	let reason = fields::FAIL_REASON.pull_opt(&mut rest).ok().flatten();
	ClientError::Transaction { reason }
}

fn parse_match(mut rest: Obj) -> Result<MatchNotification, ClientError> {
	let match_type = MatchType::parse(&fields::MATCH_TYPE.pull(&mut rest)?)?;
	let notification = MatchNotification {
		match_type,
		service_id: fields::SERVICE_ID.pull(&mut rest)?,
		generation: fields::GENERATION.pull_opt(&mut rest)?,
		props: fields::SERVICE_PROPS.pull_opt(&mut rest)?,
		ttl: fields::TTL.pull_opt(&mut rest)?,
		client_id: fields::CLIENT_ID.pull_opt(&mut rest)?,
		orphan_since: fields::ORPHAN_SINCE.pull_opt(&mut rest)?,
	};
	ensure_consumed(&rest)?;
	Ok(notification)
}

fn parse_service(mut rest: Obj) -> Result<ServiceInfo, ClientError> {
	let info = ServiceInfo {
		service_id: fields::SERVICE_ID.pull(&mut rest)?,
		generation: fields::GENERATION.pull(&mut rest)?,
		props: fields::SERVICE_PROPS.pull(&mut rest)?,
		ttl: fields::TTL.pull(&mut rest)?,
		client_id: fields::CLIENT_ID.pull(&mut rest)?,
		orphan_since: fields::ORPHAN_SINCE.pull_opt(&mut rest)?,
	};
	ensure_consumed(&rest)?;
	Ok(info)
}

fn parse_subscription(mut rest: Obj) -> Result<SubscriptionInfo, ClientError> {
	let info = SubscriptionInfo {
		subscription_id: fields::SUBSCRIPTION_ID.pull(&mut rest)?,
		client_id: fields::CLIENT_ID.pull(&mut rest)?,
		filter: fields::FILTER.pull_opt(&mut rest)?,
	};
	ensure_consumed(&rest)?;
	Ok(info)
}

fn parse_client(mut rest: Obj) -> Result<ClientInfo, ClientError> {
	let info = ClientInfo {
		client_id: fields::CLIENT_ID.pull(&mut rest)?,
		client_address: fields::CLIENT_ADDR.pull(&mut rest)?,
		time: fields::TIME.pull(&mut rest)?,
		idle: fields::IDLE.pull_opt(&mut rest)?,
		proto_version: fields::PROTO_VERSION.pull_opt(&mut rest)?,
		latency: fields::LATENCY.pull_opt(&mut rest)?,
	};
	ensure_consumed(&rest)?;
	Ok(info)
}

async fn connect_transport(spec: &ServerSpec, local_ip: Option<IpAddr>) -> Result<IoStream, ClientError> {
	let (scheme, rest) = spec
		.addr
		.split_once(':')
		.ok_or_else(|| ClientError::Domain(format!("malformed address \"{}\"", spec.addr)))?;
	match scheme {
		"tcp" => {
			let (host, port) = split_host_port(&spec.addr, rest)?;
			Ok(IoStream::Tcp(connect_tcp(host, port, local_ip).await?))
		}
		"tls" => {
			let (host, port) = split_host_port(&spec.addr, rest)?;
			let tcp = connect_tcp(host, port, local_ip).await?;
			Ok(IoStream::Tls(Box::new(connect_tls(spec, host, tcp).await?)))
		}
		"ux" => {
			use std::os::linux::net::SocketAddrExt;
			let connect = || -> std::io::Result<UnixStream> {
				let addr = std::os::unix::net::SocketAddr::from_abstract_name(rest.as_bytes())?;
				let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
				stream.set_nonblocking(true)?;
				UnixStream::from_std(stream)
			};
			Ok(IoStream::Ux(connect()?))
		}
		other => Err(ClientError::Domain(format!("unknown address scheme \"{other}\""))),
	}
}

fn split_host_port<'a>(addr: &str, rest: &'a str) -> Result<(&'a str, u16), ClientError> {
	let (host, port) = rest
		.rsplit_once(':')
		.ok_or_else(|| ClientError::Domain(format!("malformed address \"{addr}\"")))?;
	let port = port.parse().map_err(|_| ClientError::Domain(format!("malformed port in \"{addr}\"")))?;
	Ok((host, port))
}

async fn connect_tcp(host: &str, port: u16, local_ip: Option<IpAddr>) -> Result<TcpStream, ClientError> {
	let remote = tokio::net::lookup_host((host, port))
		.await?
		.next()
		.ok_or_else(|| ClientError::Domain(format!("unable to resolve \"{host}\"")))?;
	let stream = match local_ip {
		None => TcpStream::connect(remote).await?,
		Some(ip) => {
			let socket = if remote.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
			socket.bind(std::net::SocketAddr::new(ip, 0))?;
			socket.connect(remote).await?
		}
	};
	let _ = stream.set_nodelay(true);
	Ok(stream)
}

async fn connect_tls(spec: &ServerSpec, host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>, ClientError> {
	let tc = spec
		.tls_tc
		.as_ref()
		.ok_or_else(|| ClientError::Domain("tls address requires a trusted CA file".to_owned()))?;

	let mut roots = RootCertStore::empty();
	let tc_file = std::fs::File::open(tc)?;
	for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(tc_file)) {
		let cert = cert?;
		roots.add(cert).map_err(|e| ClientError::Transport(format!("invalid CA certificate: {e}")))?;
	}
	let builder = ClientConfig::builder().with_root_certificates(roots);

	let config = match (&spec.tls_cert, &spec.tls_key) {
		(Some(cert_path), Some(key_path)) => {
			let cert_file = std::fs::File::open(cert_path)?;
			let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file)).collect();
			let key_file = std::fs::File::open(key_path)?;
			let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
				.ok_or_else(|| ClientError::Transport(format!("no private key in {}", key_path.display())))?;
			builder
				.with_client_auth_cert(certs?, key)
				.map_err(|e| ClientError::Transport(format!("invalid client certificate: {e}")))?
		}
		_ => builder.with_no_client_auth(),
	};

	let server_name = ServerName::try_from(host.to_owned()).map_err(|_| ClientError::Domain(format!("invalid server name \"{host}\"")))?;
	let connector = TlsConnector::from(std::sync::Arc::new(config));
	Ok(connector.connect(server_name, tcp).await.map_err(ClientError::from)?)
}
