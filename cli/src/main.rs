// gattlink: command-line client for BLE GATT peripherals
//
// Cross-platform (macOS, Linux, Windows) front end over btleplug: probe a
// single peripheral through a GATT session, or watch advertisements age out.

mod config;
mod radio;
mod watch;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use gattlink_core::gatt::uuids;
use gattlink_core::{
    CharacteristicId, ConnectRequest, DeviceAddress, DisconnectReason, GattListener, GattService,
    GattSession, GattStatus, LinkDecision, NotificationMode, NotificationRequest, OperationKind,
    OperationOptions, Retention, SessionRegistry, Settings, TimeoutDecision, WriteRequest,
};
use radio::BtleplugRadio;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gattlink")]
#[command(about = "gattlink: BLE GATT client sessions from the command line", long_about = None)]
#[command(version)]
struct Cli {
    /// Use this settings file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a peripheral, run operations, then disconnect
    Probe(ProbeArgs),
    /// Scan and show recently seen peripherals
    Watch {
        /// How long to scan, in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,
        /// Forget devices silent for this many milliseconds (default from settings)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Manage settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct ProbeArgs {
    /// Peripheral address, e.g. C0:FF:EE:00:00:01
    address: String,
    /// Characteristic to read, as SERVICE/CHARACTERISTIC (16-bit or full UUIDs)
    #[arg(long)]
    read: Vec<String>,
    /// Characteristic to write, as SERVICE/CHARACTERISTIC=HEX
    #[arg(long)]
    write: Vec<String>,
    /// Characteristic to enable notifications on
    #[arg(long)]
    notify: Vec<String>,
    /// Read the remote RSSI
    #[arg(long)]
    rssi: bool,
    /// Keep the link up this many seconds to print notifications
    #[arg(long, default_value = "0")]
    listen: u64,
    /// Give up scanning for the peripheral after this many seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every setting
    Show,
    /// Write a settings file with defaults
    Init {
        #[arg(long)]
        force: bool,
    },
    Get { key: String },
    Set { key: String, value: String },
    /// Print the settings file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_file.as_deref())?;

    let config_path = match cli.config {
        Some(path) => path,
        None => config::config_file()?,
    };

    match cli.command {
        Commands::Probe(args) => cmd_probe(args, config::load_from(&config_path)?).await,
        Commands::Watch { duration, ttl } => {
            cmd_watch(duration, ttl, config::load_from(&config_path)?).await
        }
        Commands::Config { action } => cmd_config(action, &config_path),
    }
}

fn init_tracing(
    verbose: u8,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let Some(path) = log_file else {
        gattlink_core::init_logging(default_filter);
        return Ok(None);
    };

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().context("Log file path has no file name")?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;
    Ok(Some(guard))
}

// ============================================================================
// ARGUMENT PARSING
// ============================================================================

/// Accepts a 16-bit assigned number ("2a19") or a full UUID
fn parse_uuid(text: &str) -> Result<Uuid> {
    let text = text.trim();
    if text.len() <= 4 {
        let short = u16::from_str_radix(text, 16)
            .with_context(|| format!("Invalid 16-bit UUID: {}", text))?;
        return Ok(uuids::from_short(short));
    }
    Uuid::parse_str(text).with_context(|| format!("Invalid UUID: {}", text))
}

fn parse_characteristic(text: &str) -> Result<CharacteristicId> {
    let (service, characteristic) = text
        .split_once('/')
        .with_context(|| format!("Expected SERVICE/CHARACTERISTIC, got {}", text))?;
    Ok(CharacteristicId::new(
        parse_uuid(service)?,
        parse_uuid(characteristic)?,
    ))
}

fn parse_write(text: &str) -> Result<(CharacteristicId, Vec<u8>)> {
    let (target, value) = text
        .split_once('=')
        .with_context(|| format!("Expected SERVICE/CHARACTERISTIC=HEX, got {}", text))?;
    let value = hex::decode(value.trim()).with_context(|| format!("Invalid hex value: {}", value))?;
    Ok((parse_characteristic(target)?, value))
}

fn format_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) if !text.is_empty() && text.chars().all(|c| !c.is_control()) => {
            format!("{} {}", hex::encode(value), format!("\"{}\"", text).dimmed())
        }
        _ => hex::encode(value),
    }
}

fn describe_characteristic(id: &CharacteristicId) -> String {
    format!("{} / {}", uuids::describe(&id.service), uuids::describe(&id.characteristic))
}

// ============================================================================
// PROBE
// ============================================================================

enum Report {
    Connected(Duration),
    Services(Vec<GattService>, bool),
    Read(CharacteristicId, Vec<u8>, bool),
    Written(CharacteristicId, bool),
    Subscribed(CharacteristicId, bool),
    Changed(CharacteristicId, Vec<u8>),
    Rssi(i16, bool),
    TimedOut(OperationKind, Duration),
    Disconnected(GattStatus, DisconnectReason, Duration),
}

/// Forwards session events to the probe command
struct ProbeListener {
    reports: mpsc::UnboundedSender<Report>,
}

impl ProbeListener {
    fn send(&self, report: Report) {
        let _ = self.reports.send(report);
    }
}

impl GattListener for ProbeListener {
    fn on_connected(&self, _session: &GattSession, elapsed: Duration) -> LinkDecision {
        self.send(Report::Connected(elapsed));
        LinkDecision::Keep
    }

    fn on_services_discovered(
        &self,
        _session: &GattSession,
        services: &[GattService],
        success: bool,
        _elapsed: Duration,
    ) -> LinkDecision {
        self.send(Report::Services(services.to_vec(), success));
        LinkDecision::Keep
    }

    fn on_characteristic_read(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicId,
        value: &[u8],
        success: bool,
        _elapsed: Duration,
    ) -> LinkDecision {
        self.send(Report::Read(*characteristic, value.to_vec(), success));
        LinkDecision::Keep
    }

    fn on_characteristic_write(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicId,
        success: bool,
        _elapsed: Duration,
    ) -> LinkDecision {
        self.send(Report::Written(*characteristic, success));
        LinkDecision::Keep
    }

    fn on_characteristic_set_notification(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicId,
        success: bool,
        _elapsed: Duration,
    ) -> LinkDecision {
        self.send(Report::Subscribed(*characteristic, success));
        LinkDecision::Keep
    }

    fn on_characteristic_changed(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicId,
        value: &[u8],
    ) -> LinkDecision {
        self.send(Report::Changed(*characteristic, value.to_vec()));
        LinkDecision::Keep
    }

    fn on_read_remote_rssi(
        &self,
        _session: &GattSession,
        rssi: i16,
        success: bool,
        _elapsed: Duration,
    ) -> LinkDecision {
        self.send(Report::Rssi(rssi, success));
        LinkDecision::Keep
    }

    fn on_operation_timeout(
        &self,
        _session: &GattSession,
        kind: OperationKind,
        timeout: Duration,
        _elapsed: Duration,
    ) -> TimeoutDecision {
        self.send(Report::TimedOut(kind, timeout));
        TimeoutDecision::Disconnect
    }

    fn on_disconnected(
        &self,
        _session: &GattSession,
        status: GattStatus,
        reason: DisconnectReason,
        elapsed: Duration,
    ) -> Retention {
        self.send(Report::Disconnected(status, reason, elapsed));
        Retention::Keep
    }
}

fn mark(success: bool) -> ColoredString {
    if success {
        "✓".green()
    } else {
        "✗".red()
    }
}

fn print_report(report: &Report) {
    match report {
        Report::Connected(elapsed) => {
            println!("  {} Connected in {:?}", "✓".green(), elapsed);
        }
        Report::Services(services, success) => {
            println!("  {} Services discovered ({})", mark(*success), services.len());
            for service in services {
                println!("    {} {}", "•".bright_green(), uuids::describe(&service.uuid).bright_cyan());
                for characteristic in &service.characteristics {
                    println!("        {}", uuids::describe(characteristic).dimmed());
                }
            }
        }
        Report::Read(id, value, success) => {
            println!(
                "  {} Read {}: {}",
                mark(*success),
                describe_characteristic(id).bright_cyan(),
                format_value(value)
            );
        }
        Report::Written(id, success) => {
            println!("  {} Wrote {}", mark(*success), describe_characteristic(id).bright_cyan());
        }
        Report::Subscribed(id, success) => {
            println!(
                "  {} Notifications on {}",
                mark(*success),
                describe_characteristic(id).bright_cyan()
            );
        }
        Report::Changed(id, value) => {
            println!(
                "  {} {} {}",
                "~".bright_yellow(),
                describe_characteristic(id).bright_cyan(),
                format_value(value)
            );
        }
        Report::Rssi(rssi, success) => {
            println!("  {} RSSI {} dBm", mark(*success), rssi);
        }
        Report::TimedOut(kind, timeout) => {
            println!("  {} {} timed out after {:?}", "⏱".yellow(), kind, timeout);
        }
        Report::Disconnected(status, reason, elapsed) => {
            println!(
                "  {} Disconnected: {} ({}) after {:?}",
                "•".dimmed(),
                reason,
                status.describe(),
                elapsed
            );
        }
    }
}

/// Print reports until one satisfies `done`. A disconnect ends the probe.
async fn wait_for(
    reports: &mut mpsc::UnboundedReceiver<Report>,
    done: impl Fn(&Report) -> bool,
) -> Result<Report> {
    while let Some(report) = reports.recv().await {
        print_report(&report);
        if done(&report) {
            return Ok(report);
        }
        if let Report::Disconnected(_, reason, _) = report {
            anyhow::bail!("Link lost: {}", reason);
        }
    }
    anyhow::bail!("Session stopped reporting")
}

fn failed(operation: &str) -> anyhow::Error {
    anyhow::anyhow!("{} failed", operation)
}

async fn cmd_probe(args: ProbeArgs, settings: Settings) -> Result<()> {
    let address: DeviceAddress = args.address.parse()?;
    let reads = args
        .read
        .iter()
        .map(|r| parse_characteristic(r))
        .collect::<Result<Vec<_>>>()?;
    let writes = args
        .write
        .iter()
        .map(|w| parse_write(w))
        .collect::<Result<Vec<_>>>()?;
    let notifies = args
        .notify
        .iter()
        .map(|n| parse_characteristic(n))
        .collect::<Result<Vec<_>>>()?;

    let radio = Arc::new(BtleplugRadio::first_adapter().await?);
    println!("{} {}...", "Scanning for".bold(), address.to_string().bright_cyan());
    if !radio
        .find(address, Duration::from_secs(args.scan_timeout))
        .await?
    {
        anyhow::bail!("{} was not seen within {}s", address, args.scan_timeout);
    }

    let sessions = SessionRegistry::new(radio.clone(), settings.gatt.clone());
    let session = sessions.get_or_create(address)?;
    let (tx, mut reports) = mpsc::unbounded_channel();
    session.add_listener(Arc::new(ProbeListener { reports: tx }));

    session.connect(ConnectRequest::new())?;
    let outcome = run_probe(&session, &mut reports, reads, writes, notifies, args.rssi, args.listen).await;

    if session.is_connected() {
        sessions.release(&session);
        let wait = wait_for(&mut reports, |r| matches!(r, Report::Disconnected(..)));
        if tokio::time::timeout(settings.gatt.disconnect_timeout() * 4, wait)
            .await
            .is_err()
        {
            tracing::warn!("{} disconnect not reported", address);
        }
    } else {
        sessions.close_all();
    }
    outcome
}

async fn run_probe(
    session: &GattSession,
    reports: &mut mpsc::UnboundedReceiver<Report>,
    reads: Vec<CharacteristicId>,
    writes: Vec<(CharacteristicId, Vec<u8>)>,
    notifies: Vec<CharacteristicId>,
    rssi: bool,
    listen: u64,
) -> Result<()> {
    match wait_for(reports, |r| matches!(r, Report::Services(..))).await? {
        Report::Services(_, true) => {}
        _ => return Err(failed("Service discovery")),
    }

    for id in reads {
        session.read(id, OperationOptions::new())?;
        if let Report::Read(_, _, false) = wait_for(reports, |r| matches!(r, Report::Read(..))).await? {
            return Err(failed("Read"));
        }
    }
    for (id, value) in writes {
        session.write(WriteRequest::new(id, value))?;
        if let Report::Written(_, false) =
            wait_for(reports, |r| matches!(r, Report::Written(..))).await?
        {
            return Err(failed("Write"));
        }
    }
    for id in notifies {
        session.set_notification(NotificationRequest::new(id, NotificationMode::Notify))?;
        if let Report::Subscribed(_, false) =
            wait_for(reports, |r| matches!(r, Report::Subscribed(..))).await?
        {
            return Err(failed("Enabling notifications"));
        }
    }
    if rssi {
        session.read_rssi(OperationOptions::new())?;
        if let Report::Rssi(_, false) = wait_for(reports, |r| matches!(r, Report::Rssi(..))).await? {
            return Err(failed("RSSI read"));
        }
    }

    if listen > 0 {
        println!("{} for {}s...", "Listening".bold(), listen);
        let listening = wait_for(reports, |_| false);
        if let Ok(result) = tokio::time::timeout(Duration::from_secs(listen), listening).await {
            result?;
        }
    }
    Ok(())
}

// ============================================================================
// WATCH / CONFIG
// ============================================================================

async fn cmd_watch(duration: u64, ttl: Option<u64>, settings: Settings) -> Result<()> {
    let ttl = ttl
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.registry.default_ttl());
    let radio = BtleplugRadio::first_adapter().await?;
    watch::run(&radio, Duration::from_secs(duration), ttl).await
}

fn cmd_config(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let settings = config::load_from(path)?;
            println!("{} ({})", "Configuration".bold(), path.display());
            println!();
            for (key, value) in config::list(&settings) {
                println!("  {:<30} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            config::save_to(&Settings::default(), path)?;
            println!("{} Wrote defaults to {}", "✓".green(), path.display());
        }

        ConfigAction::Get { key } => {
            let settings = config::load_from(path)?;
            match config::get(&settings, &key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }

        ConfigAction::Set { key, value } => {
            let mut settings = config::load_from(path)?;
            config::set(&mut settings, &key, &value)?;
            config::save_to(&settings, path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Path => println!("{}", path.display()),
    }
    Ok(())
}
