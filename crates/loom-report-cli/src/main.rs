// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! loom-report - drives the report agent from the command line.
//!
//! Every invocation is one application session: the engine starts, evaluates
//! how the previous session ended, delivers what is pending and, unless the
//! session is left to die, records a clean exit.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use loom_report_agent::config::{
	default_database_path, ENV_APPLICATION, ENV_DATABASE, ENV_URL, ENV_VERSION,
};
use loom_report_agent::{AgentConfig, DeliverySummary, Engine, ReportRepository};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
	Pretty,
	Compact,
	Json,
}

/// Crash and OOM report agent host
#[derive(Parser, Debug)]
#[command(name = "loom-report", version, about, long_about = None)]
struct Args {
	/// Submission endpoint for multipart report uploads
	#[arg(long, env = ENV_URL)]
	url: Option<String>,

	/// Directory holding pending reports and lifecycle state
	#[arg(long, env = ENV_DATABASE)]
	database: Option<PathBuf>,

	#[arg(long, env = ENV_APPLICATION)]
	application: Option<String>,

	#[arg(long, env = ENV_VERSION)]
	app_version: Option<String>,

	/// Client attribute (repeatable: -a KEY=VALUE)
	#[arg(long, short = 'a', value_name = "KEY=VALUE")]
	attribute: Vec<String>,

	/// File attached to crash and manual reports (repeatable)
	#[arg(long)]
	attachment: Vec<PathBuf>,

	/// Turn off out-of-memory inference
	#[arg(long)]
	no_oom: bool,

	/// Request timeout in seconds
	#[arg(long, default_value = "30")]
	timeout: u64,

	/// Maximum uploads per delivery pass
	#[arg(long)]
	max_per_pass: Option<usize>,

	/// Uploads kept in flight at once during a delivery pass
	#[arg(long)]
	max_concurrent: Option<usize>,

	#[arg(long, value_enum, default_value = "pretty")]
	log_format: LogFormat,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Start a session, deliver pending reports and exit cleanly
	Send,
	/// List pending reports without starting a session
	List {
		/// Output as JSON
		#[arg(long)]
		json: bool,
	},
	/// Record and deliver a manual report
	Report {
		message: String,
		/// The fault happened on the main thread
		#[arg(long)]
		main_thread: bool,
	},
	/// Take ownership of a crash dump a native handler wrote for an earlier
	/// process, then deliver it
	Crash { path: PathBuf },
	/// Run a session driven by lifecycle events read from stdin
	///
	/// One event per line: foreground, background, low-memory,
	/// report <message>, hang <message>, crash <path>, attr KEY=VALUE,
	/// send, exit.
	/// End of input without `exit` leaves the session as if killed.
	Run,
}

fn init_tracing(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new("loom_report=info"));

	match format {
		LogFormat::Json => {
			tracing_subscriber::registry()
				.with(filter)
				.with(fmt::layer().json().with_writer(std::io::stderr))
				.init();
		}
		LogFormat::Compact => {
			tracing_subscriber::registry()
				.with(filter)
				.with(fmt::layer().compact().with_writer(std::io::stderr))
				.init();
		}
		LogFormat::Pretty => {
			tracing_subscriber::registry()
				.with(filter)
				.with(fmt::layer().with_writer(std::io::stderr))
				.init();
		}
	}
}

fn parse_key_value(raw: &str) -> Result<(String, String)> {
	match raw.split_once('=') {
		Some((key, value)) if !key.trim().is_empty() => {
			Ok((key.trim().to_string(), value.to_string()))
		}
		_ => bail!("expected KEY=VALUE, got {raw:?}"),
	}
}

fn database_path(args: &Args) -> Result<PathBuf> {
	args
		.database
		.clone()
		.or_else(default_database_path)
		.context("no report database path; pass --database")
}

fn build_config(args: &Args) -> Result<AgentConfig> {
	let url = args
		.url
		.clone()
		.context("no submission URL; pass --url or set LOOM_REPORT_URL")?;

	let mut builder = AgentConfig::builder()
		.base_url(url)
		.database_path(database_path(args)?)
		.oom_support(!args.no_oom)
		.request_timeout(Duration::from_secs(args.timeout));

	if let Some(application) = &args.application {
		builder = builder.application(application);
	}
	if let Some(version) = &args.app_version {
		builder = builder.application_version(version);
	}
	for raw in &args.attribute {
		let (key, value) = parse_key_value(raw)?;
		builder = builder.attribute(key, value);
	}
	for path in &args.attachment {
		builder = builder.attachment(path);
	}
	if let Some(max) = args.max_per_pass {
		builder = builder.max_reports_per_pass(max);
	}
	if let Some(max) = args.max_concurrent {
		builder = builder.max_concurrent_uploads(max);
	}
	// Handed over before start so the previous session is not also judged
	// an OOM kill.
	if let Command::Crash { path } = &args.command {
		builder = builder.pending_crash(path);
	}

	builder.build().context("invalid agent configuration")
}

fn print_summary(summary: &DeliverySummary) {
	println!(
		"attempted {} delivered {} retained {}",
		summary.attempted, summary.delivered, summary.retained
	);
}

/// Waits for uploads started by `native_report` before the runtime shuts down.
async fn settle(engine: &Engine, limit: Duration) {
	let deadline = tokio::time::Instant::now() + limit;
	while engine.in_flight_uploads() > 0 {
		if tokio::time::Instant::now() >= deadline {
			warn!("uploads still running at exit, reports stay pending");
			return;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}

fn list(args: &Args, json: bool) -> Result<()> {
	let repository = ReportRepository::open(&database_path(args)?)?;
	let mut rows = Vec::new();

	for handle in repository.enumerate_pending(None)? {
		let Some(report) = repository.load(&handle)? else {
			continue;
		};
		rows.push(serde_json::json!({
			"id": report.id().to_string(),
			"kind": report.kind().to_string(),
			"created_at": report.created_at.to_rfc3339(),
			"bytes": report.artifact.payload.len(),
			"attributes": report.attributes.len(),
			"attachments": report.attachments.len(),
		}));
	}

	if json {
		println!("{}", serde_json::to_string_pretty(&rows)?);
		return Ok(());
	}

	if rows.is_empty() {
		println!("no pending reports");
	}
	for row in &rows {
		println!(
			"{}  {:<14} {}  {} bytes",
			row["id"].as_str().unwrap_or_default(),
			row["kind"].as_str().unwrap_or_default(),
			row["created_at"].as_str().unwrap_or_default(),
			row["bytes"]
		);
	}
	Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEvent {
	Foreground,
	Background,
	LowMemory,
	Report(String),
	Hang(String),
	Crash(PathBuf),
	Attribute(String, String),
	Send,
	Exit,
}

fn parse_event(line: &str) -> Result<Option<SessionEvent>> {
	let line = line.trim();
	if line.is_empty() || line.starts_with('#') {
		return Ok(None);
	}
	let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
	let rest = rest.trim();

	let event = match word {
		"foreground" => SessionEvent::Foreground,
		"background" => SessionEvent::Background,
		"low-memory" => SessionEvent::LowMemory,
		"report" if !rest.is_empty() => SessionEvent::Report(rest.to_string()),
		"hang" if !rest.is_empty() => SessionEvent::Hang(rest.to_string()),
		"crash" if !rest.is_empty() => SessionEvent::Crash(PathBuf::from(rest)),
		"attr" => {
			let (key, value) = parse_key_value(rest)?;
			SessionEvent::Attribute(key, value)
		}
		"send" => SessionEvent::Send,
		"exit" => SessionEvent::Exit,
		_ => bail!("unrecognised event {line:?}"),
	};
	Ok(Some(event))
}

async fn run_session(engine: &Engine) -> Result<()> {
	let mut diagnostics = engine.subscribe_diagnostics();
	tokio::spawn(async move {
		while let Ok(event) = diagnostics.recv().await {
			eprintln!("diagnostic: {} failed: {}", event.operation, event.error);
		}
	});

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await? {
		let event = match parse_event(&line) {
			Ok(Some(event)) => event,
			Ok(None) => continue,
			Err(e) => {
				eprintln!("{e}");
				continue;
			}
		};

		match event {
			SessionEvent::Foreground => engine.foreground_notification(),
			SessionEvent::Background => engine.background_notification(),
			SessionEvent::LowMemory => engine.low_memory_notification(),
			SessionEvent::Report(message) => {
				if let Some(id) = engine.native_report(&message, true) {
					println!("{id}");
				}
			}
			SessionEvent::Hang(message) => {
				if let Some(id) = engine.report_hang(&message) {
					println!("{id}");
				}
			}
			SessionEvent::Crash(path) => {
				if let Some(id) = engine.record_native_crash(&path) {
					println!("{id}");
				}
			}
			SessionEvent::Attribute(key, value) => engine.add_attribute(key, value),
			SessionEvent::Send => print_summary(&engine.send_pending_reports().await),
			SessionEvent::Exit => {
				settle(engine, engine.config().request_timeout).await;
				engine.termination_notification();
				info!("session ended cleanly");
				return Ok(());
			}
		}
	}

	settle(engine, engine.config().request_timeout).await;
	warn!("input closed without exit, leaving session state as if killed");
	Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	init_tracing(args.log_format);

	if let Command::List { json } = &args.command {
		return list(&args, *json);
	}

	if let Command::Crash { path } = &args.command {
		if !path.is_file() {
			bail!("no crash dump at {}", path.display());
		}
	}

	let config = build_config(&args)?;
	let timeout = config.request_timeout;
	let engine = Engine::start(config)
		.await
		.context("failed to start report engine")?;

	if let Some(summary) = engine.wait_for_startup_delivery().await {
		if summary.attempted > 0 {
			print_summary(&summary);
		}
	}

	match &args.command {
		Command::Send => {
			print_summary(&engine.send_pending_reports().await);
			engine.termination_notification();
		}
		Command::Report {
			message,
			main_thread,
		} => {
			let id = engine
				.native_report(message, *main_thread)
				.context("failed to record report")?;
			println!("{id}");
			settle(&engine, timeout).await;
			engine.termination_notification();
		}
		Command::Crash { path } => {
			if path.exists() {
				bail!("failed to record crash dump {}", path.display());
			}
			engine.termination_notification();
		}
		Command::Run => run_session(&engine).await?,
		Command::List { .. } => {}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_key_value_pairs() {
		assert_eq!(
			parse_key_value("level=4").unwrap(),
			("level".to_string(), "4".to_string())
		);
		assert_eq!(
			parse_key_value("url=a=b").unwrap(),
			("url".to_string(), "a=b".to_string())
		);
		assert!(parse_key_value("=4").is_err());
		assert!(parse_key_value("level").is_err());
	}

	#[test]
	fn parses_session_events() {
		assert_eq!(parse_event("  ").unwrap(), None);
		assert_eq!(parse_event("# comment").unwrap(), None);
		assert_eq!(
			parse_event("foreground").unwrap(),
			Some(SessionEvent::Foreground)
		);
		assert_eq!(
			parse_event("low-memory").unwrap(),
			Some(SessionEvent::LowMemory)
		);
		assert_eq!(
			parse_event("report shader cache miss").unwrap(),
			Some(SessionEvent::Report("shader cache miss".to_string()))
		);
		assert_eq!(
			parse_event("hang main loop stalled").unwrap(),
			Some(SessionEvent::Hang("main loop stalled".to_string()))
		);
		assert_eq!(
			parse_event("crash /tmp/a.dmp").unwrap(),
			Some(SessionEvent::Crash(PathBuf::from("/tmp/a.dmp")))
		);
		assert_eq!(
			parse_event("attr scene=menu").unwrap(),
			Some(SessionEvent::Attribute("scene".into(), "menu".into()))
		);
		assert!(parse_event("report").is_err());
		assert!(parse_event("jump").is_err());
	}

	#[test]
	fn cli_arguments_parse() {
		let args = Args::try_parse_from([
			"loom-report",
			"--url",
			"https://reports.example.com/submit",
			"--database",
			"/tmp/reports",
			"-a",
			"level=4",
			"--log-format",
			"json",
			"report",
			"boom",
			"--main-thread",
		])
		.unwrap();

		let config = build_config(&args).unwrap();
		assert_eq!(config.database_path, PathBuf::from("/tmp/reports"));
		assert_eq!(config.attributes.get("level").map(String::as_str), Some("4"));
		assert!(matches!(
			args.command,
			Command::Report {
				main_thread: true,
				..
			}
		));
	}

	#[test]
	fn crash_dump_is_handed_over_at_start() {
		let args = Args::try_parse_from([
			"loom-report",
			"--url",
			"https://reports.example.com/submit",
			"--database",
			"/tmp/reports",
			"--max-concurrent",
			"2",
			"crash",
			"/tmp/reports/native.dmp",
		])
		.unwrap();

		let config = build_config(&args).unwrap();
		assert_eq!(config.pending_crashes, vec![PathBuf::from("/tmp/reports/native.dmp")]);
		assert_eq!(config.max_concurrent_uploads, 2);
	}
}
