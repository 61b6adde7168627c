//! Server assembly: bind every configured domain's sockets, spawn the
//! domain actors and accept loops, and tie their lifetime to a shutdown
//! signal.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Conf;
use crate::domain::{DomainActor, DomainSettings};
use crate::transport::{accept_loop, Listener};
use crate::ServerError;

struct DomainRuntime {
	addrs: Vec<String>,
	actor: JoinHandle<()>,
	accept_tasks: Vec<JoinHandle<()>>,
}

pub struct Server {
	domains: Vec<DomainRuntime>,
	shutdown_tx: watch::Sender<bool>,
}

impl Server {
	/// Bind all listen sockets and start the domain actors. Any socket
	/// failing to bind fails the whole server.
	pub async fn bind(conf: &Conf) -> Result<Server, ServerError> {
		let (shutdown_tx, _) = watch::channel(false);
		let conn_ids = Arc::new(AtomicU64::new(1));
		let mut domains = Vec::new();

		for domain_conf in &conf.domains {
			let mut listeners = Vec::new();
			for socket in &domain_conf.sockets {
				listeners.push(Listener::bind(socket).await?);
			}
			let addrs: Vec<String> = listeners.iter().map(|l| l.local_addr().to_owned()).collect();
			match &domain_conf.name {
				Some(name) => info!("Domain \"{name}\" has addresses {}.", addrs.join(", ")),
				None => info!("Domain has addresses {}.", addrs.join(", ")),
			}

			let (events_tx, events_rx) = mpsc::unbounded_channel();
			let (accepting_tx, accepting_rx) = watch::channel(true);

			let actor = DomainActor::new(
				DomainSettings::of(domain_conf),
				&conf.resources,
				events_rx,
				accepting_tx,
				shutdown_tx.subscribe(),
			);
			let actor = tokio::spawn(actor.run());

			let accept_tasks = listeners
				.into_iter()
				.map(|listener| {
					tokio::spawn(accept_loop(
						listener,
						events_tx.clone(),
						Arc::clone(&conn_ids),
						accepting_rx.clone(),
						shutdown_tx.subscribe(),
					))
				})
				.collect();

			domains.push(DomainRuntime {
				addrs,
				actor,
				accept_tasks,
			});
		}

		Ok(Server { domains, shutdown_tx })
	}

	/// Bound addresses of one domain, wildcard ports resolved.
	#[must_use]
	pub fn local_addrs(&self, domain: usize) -> &[String] {
		self.domains.get(domain).map(|d| d.addrs.as_slice()).unwrap_or_default()
	}

	/// Begin a graceful shutdown: stop accepting, close every
	/// connection, unwind the actors.
	pub fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	/// Wait for every domain to wind down.
	pub async fn join(self) {
		for domain in self.domains {
			for task in domain.accept_tasks {
				let _ = task.await;
			}
			let _ = domain.actor.await;
		}
	}

	/// Run until SIGTERM, SIGHUP or SIGINT, then shut down gracefully.
	pub async fn run(self) {
		let shutdown_tx = self.shutdown_tx.clone();
		tokio::spawn(async move {
			wait_for_signal().await;
			info!("Exiting.");
			let _ = shutdown_tx.send(true);
		});
		self.join().await;
	}
}

async fn wait_for_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	let mut term = match signal(SignalKind::terminate()) {
		Ok(s) => s,
		Err(_) => return,
	};
	let mut hup = match signal(SignalKind::hangup()) {
		Ok(s) => s,
		Err(_) => return,
	};
	let mut int = match signal(SignalKind::interrupt()) {
		Ok(s) => s,
		Err(_) => return,
	};

	tokio::select! {
		_ = term.recv() => {}
		_ = hup.recv() => {}
		_ = int.recv() => {}
	}
}
