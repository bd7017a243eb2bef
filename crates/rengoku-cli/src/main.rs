mod api;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use rengoku::{config, Config, ProcessSpec, Scheduler, StopMode, Supervisor};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "rengoku", version, about = "Keep-alive process supervisor")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Supervise the configured processes until Ctrl-C
	Run {
		#[arg(short, long, default_value = "rengoku.toml")]
		config: PathBuf,
		/// Serve the JSON status API on 127.0.0.1:<port>
		#[arg(long)]
		http_port: Option<u16>,
		/// trace, debug, info, warn or error
		#[arg(long)]
		log_level: Option<String>,
	},
	/// Validate a config file and list the processes it defines
	Check {
		#[arg(short, long, default_value = "rengoku.toml")]
		config: PathBuf,
	},
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	match cli.command {
		Command::Run {
			config,
			http_port,
			log_level,
		} => run(&config, http_port, log_level).await,
		Command::Check { config } => check(&config),
	}
}

fn load_or_exit(path: &Path) -> Config {
	match config::load(path) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			std::process::exit(1);
		}
	}
}

async fn run(path: &Path, http_port: Option<u16>, log_level: Option<String>) {
	let config = load_or_exit(path);

	let level = log_level.unwrap_or_else(|| config.daemon.log_level.clone());
	let level = tracing::Level::from_str(&level).unwrap_or_else(|_| {
		eprintln!("{} unknown log level `{}`, using info", "warning:".yellow().bold(), level);
		tracing::Level::INFO
	});
	tracing_subscriber::fmt().with_max_level(level).init();

	let scheduler = match Scheduler::new() {
		Ok(s) => s,
		Err(e) => {
			tracing::error!("{}", e);
			std::process::exit(1);
		}
	};
	if let Err(e) = scheduler.start() {
		tracing::error!("{}", e);
		std::process::exit(1);
	}

	let supervisor = Arc::new(Supervisor::new(scheduler.clone()));
	let started = {
		let sup = Arc::clone(&supervisor);
		let specs = config.processes.clone();
		tokio::task::spawn_blocking(move || sup.start(&specs)).await
	};
	match started {
		Ok(Ok(())) => {}
		Ok(Err(e)) => {
			tracing::error!("{}", e);
			shutdown(supervisor, scheduler).await;
			std::process::exit(1);
		}
		Err(e) => {
			tracing::error!("startup task failed: {}", e);
			shutdown(supervisor, scheduler).await;
			std::process::exit(1);
		}
	}

	let http_handle = http_port.or(config.daemon.http_port).map(|port| {
		let sup = Arc::clone(&supervisor);
		tokio::spawn(async move {
			run_http_server(sup, port).await;
		})
	});

	tracing::info!("rengoku started (pid {})", std::process::id());

	tokio::select! {
		_ = async {
			if let Some(h) = http_handle { h.await.ok(); }
			else { std::future::pending::<()>().await; }
		} => {},
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("shutting down");
		}
	}

	shutdown(supervisor, scheduler).await;
}

async fn shutdown(supervisor: Arc<Supervisor>, scheduler: Scheduler) {
	let stopped = tokio::task::spawn_blocking(move || {
		supervisor.stop();
		scheduler.stop();
	})
	.await;
	if let Err(e) = stopped {
		tracing::error!("shutdown task failed: {}", e);
	}
}

async fn run_http_server(supervisor: Arc<Supervisor>, port: u16) {
	let app = api::router(supervisor);
	let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
	let listener = match tokio::net::TcpListener::bind(addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind HTTP on {}: {}", addr, e);
			return;
		}
	};
	tracing::info!("HTTP listening on {}", addr);
	if let Err(e) = axum::serve(listener, app).await {
		tracing::error!("HTTP server error: {}", e);
	}
}

fn check(path: &Path) {
	let config = load_or_exit(path);
	let specs = config.expanded();

	eprintln!("{} {} ({} processes)", "ok".green().bold(), path.display(), specs.len());
	match config.daemon.http_port {
		Some(port) => eprintln!("  http: 127.0.0.1:{}", port),
		None => eprintln!("  http: {}", "disabled".dimmed()),
	}
	eprintln!("  log level: {}", config.daemon.log_level);
	eprintln!();

	for spec in &specs {
		print_spec(spec);
	}
}

fn print_spec(spec: &ProcessSpec) {
	let start = if spec.autostart {
		format!("autostart after {}s", spec.autostart_delay_secs)
	} else {
		"manual".to_string()
	};
	let stop = match spec.stop_mode {
		StopMode::Kill => "kill",
		StopMode::KillTree => "kill-tree",
	};
	println!("{}", spec.name.bold());
	println!("  {} {}", "exe".dimmed(), spec.executable.display());
	println!("  {} {}", "cmd".dimmed(), spec.command);
	if !spec.directory.as_os_str().is_empty() {
		println!("  {} {}", "dir".dimmed(), spec.directory.display());
	}
	println!(
		"  {} {}, every {}s, stop={}, exit codes {:?}",
		"run".dimmed(),
		start,
		spec.interval_secs,
		stop,
		spec.exit_codes
	);
	if spec.runs_as_other_user() {
		println!("  {} {}", "user".dimmed(), spec.user.cyan());
	}
}
