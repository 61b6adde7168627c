use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use sd_server::addr::SockAddr;
use sd_server::config::Conf;
use sd_server::{logging, Server};

/// Service discovery server
#[derive(Parser, Debug)]
#[command(name = "sdd", disable_version_flag = true)]
struct Args {
	/// Read configuration from a YAML file
	#[arg(short = 'f', value_name = "conf-file")]
	conf_file: Option<PathBuf>,

	/// Instantiate a multi-socket domain; the '+' separator may not be
	/// used in the addresses
	#[arg(short = 'm', value_name = "addr0+...+addrN")]
	multi: Vec<String>,

	/// Set the maximum number of allowed connected clients (0 means no
	/// limit)
	#[arg(short = 'c', value_name = "max-clients")]
	max_clients: Option<u64>,

	/// Enable logging to console
	#[arg(short = 's')]
	console: bool,

	/// Enable logging directly to file
	#[arg(short = 'o', value_name = "file")]
	log_file: Option<PathBuf>,

	/// Disable logging to syslog
	#[arg(short = 'n')]
	no_syslog: bool,

	/// Set the syslog facility to use
	#[arg(short = 'y', value_name = "facility")]
	facility: Option<String>,

	/// Filter log entries below this level
	#[arg(short = 'l', value_name = "level")]
	log_filter: Option<String>,

	/// Print version information
	#[arg(short = 'v')]
	version: bool,

	/// Server addresses of single-socket domains to instantiate
	#[arg(value_name = "domain-addr")]
	domain_addrs: Vec<String>,
}

fn build_conf(args: &Args) -> Result<Conf> {
	let mut conf = match &args.conf_file {
		Some(path) => Conf::load(path).with_context(|| format!("error reading configuration from {}", path.display()))?,
		None => Conf::default(),
	};

	let mut cli_domains: Vec<Vec<SockAddr>> = Vec::new();
	for addr in &args.domain_addrs {
		cli_domains.push(vec![addr.parse()?]);
	}
	for multi in &args.multi {
		let addrs: Result<Vec<SockAddr>, _> = multi.split('+').map(str::parse).collect();
		cli_domains.push(addrs?);
	}
	if !cli_domains.is_empty() {
		conf.set_domains(cli_domains);
	}

	if let Some(max_clients) = args.max_clients {
		conf.resources.total.clients = if max_clients == 0 { None } else { Some(max_clients) };
	}
	if args.console {
		conf.log.console = true;
	}
	if let Some(log_file) = &args.log_file {
		conf.log.log_file = Some(log_file.clone());
	}
	if args.no_syslog {
		conf.log.syslog = false;
	}
	if let Some(facility) = &args.facility {
		conf.log.facility = Some(facility.clone());
	}
	if let Some(level) = &args.log_filter {
		conf.log.filter = level.parse()?;
	}

	if conf.domains.is_empty() {
		bail!("no domains configured");
	}
	Ok(conf)
}

async fn run(args: Args) -> Result<()> {
	let conf = build_conf(&args)?;
	let _log_guard = logging::init(&conf.log)?;

	let server = Server::bind(&conf).await?;
	info!("Server version {} started.", env!("CARGO_PKG_VERSION"));
	server.run().await;
	Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	let args = Args::parse();

	if args.version {
		println!("Server version: {}", env!("CARGO_PKG_VERSION"));
		println!("Protocol version(s): {}-{}", sd_proto::MIN_VERSION, sd_proto::MAX_VERSION);
		return ExitCode::SUCCESS;
	}

	match run(args).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			eprintln!("{e:#}");
			ExitCode::FAILURE
		}
	}
}
