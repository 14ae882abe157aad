//! UPF N4 daemon
//!
//! Terminates PFCP from the SMF and programs PDRs, FARs and QERs into the
//! forwarding plane.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use n4_upfd::config::{UpfConfig, DEFAULT_CONFIG_PATH};
use n4_upfd::connection::PfcpConnection;
use n4_upfd::forwarding::{ForwardingPlane, InMemoryForwardingPlane};
use n4_upfd::pfcp_path::{
    run_downlink_reports, run_heartbeat, run_usage_reports, PfcpServer,
    DOWNLINK_EVENT_POLL_INTERVAL,
};
use n4_upfd::report::{SessionReporter, UdpReportDispatcher};
use n4_upfd::teid::TeidAllocator;

/// UPF N4 control-plane daemon
#[derive(Parser, Debug)]
#[command(name = "n4-upfd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "UPF N4 (PFCP) control-plane daemon", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the configuration
    #[arg(short = 'e', long)]
    log_level: Option<String>,

    /// Disable color output
    #[arg(short = 'm', long)]
    no_color: bool,

    /// PFCP server address
    #[arg(long)]
    pfcp_addr: Option<IpAddr>,

    /// PFCP server port
    #[arg(long)]
    pfcp_port: Option<u16>,

    /// Node ID announced to the SMF
    #[arg(long)]
    node_id: Option<String>,

    /// N3 (GTP-U) address
    #[arg(long)]
    n3_addr: Option<Ipv4Addr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = UpfConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_logging(&args, &config)?;

    log::info!("n4-upfd v{} starting...", env!("CARGO_PKG_VERSION"));

    // Set up signal handlers
    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let teids = Arc::new(
        TeidAllocator::new(config.teid_pool_size).context("Failed to create TEID pool")?,
    );
    log::info!("TEID pool of {} initialized", teids.capacity());

    let forwarding: Arc<dyn ForwardingPlane> = Arc::new(InMemoryForwardingPlane::new());
    log::warn!("No datapath attached, forwarding rules are kept in memory");

    let conn = Arc::new(PfcpConnection::new(&config, teids, forwarding));
    log::info!(
        "Node ID {}, N3 address {} (advertised {})",
        conn.node_id(),
        conn.n3_address(),
        conn.advertised_n3_address()
    );

    // Create async PFCP server
    let pfcp_addr = SocketAddr::new(config.pfcp.address, config.pfcp.port);
    let pfcp_server = PfcpServer::new(pfcp_addr, conn.clone(), shutdown.clone())
        .await
        .context("Failed to create PFCP server")?;
    let pfcp_server = Arc::new(pfcp_server);
    let socket = pfcp_server.socket();

    // Run PFCP server
    let pfcp_server_clone = pfcp_server.clone();
    let pfcp_server_handle = tokio::spawn(async move {
        if let Err(e) = pfcp_server_clone.run().await {
            log::error!("PFCP server error: {}", e);
        }
        log::info!("PFCP server task finished");
    });

    let heartbeat_handle = tokio::spawn(run_heartbeat(
        conn.clone(),
        socket.clone(),
        Duration::from_secs(config.heartbeat.interval_secs),
        config.heartbeat.max_missed,
        shutdown.clone(),
    ));

    let reporter = Arc::new(SessionReporter::new(
        conn.clone(),
        Arc::new(UdpReportDispatcher::new(socket)),
    ));
    let downlink_handle = tokio::spawn(run_downlink_reports(
        reporter.clone(),
        DOWNLINK_EVENT_POLL_INTERVAL,
        shutdown.clone(),
    ));

    let usage_handle = if config.usage_report_interval_secs > 0 {
        Some(tokio::spawn(run_usage_reports(
            reporter,
            Duration::from_secs(config.usage_report_interval_secs),
            shutdown.clone(),
        )))
    } else {
        log::debug!("Periodic usage reports disabled");
        None
    };

    log::info!("n4-upfd ready");

    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Stop all tasks
    log::info!("Shutting down...");
    pfcp_server_handle.abort();
    heartbeat_handle.abort();
    downlink_handle.abort();
    if let Some(handle) = usage_handle {
        handle.abort();
    }

    log::info!("n4-upfd stopped");
    Ok(())
}

/// Apply command line overrides to the loaded configuration
fn apply_overrides(config: &mut UpfConfig, args: &Args) {
    if let Some(addr) = args.pfcp_addr {
        config.pfcp.address = addr;
    }
    if let Some(port) = args.pfcp_port {
        config.pfcp.port = port;
    }
    if let Some(node_id) = &args.node_id {
        config.pfcp.node_id = Some(node_id.clone());
    }
    if let Some(addr) = args.n3_addr {
        config.n3.address = addr;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
}

/// Initialize logging from the effective log level
fn init_logging(args: &Args, config: &UpfConfig) -> Result<()> {
    let mut builder = env_logger::Builder::new();

    let level = match config.logging.level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    builder.filter_level(level);

    // Configure format
    builder.format_timestamp_millis();

    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }

    builder
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default() {
        let args = Args::parse_from(["n4-upfd"]);
        assert_eq!(args.config, DEFAULT_CONFIG_PATH);
        assert_eq!(args.log_level, None);
        assert_eq!(args.pfcp_addr, None);
        assert_eq!(args.pfcp_port, None);
        assert!(!args.no_color);
    }

    #[test]
    fn test_args_custom() {
        let args = Args::parse_from([
            "n4-upfd",
            "-c",
            "/custom/upf.yaml",
            "-e",
            "debug",
            "--pfcp-addr",
            "10.0.0.2",
            "--pfcp-port",
            "8806",
            "--node-id",
            "upf1.example.org",
            "--n3-addr",
            "192.168.1.10",
        ]);
        assert_eq!(args.config, "/custom/upf.yaml");
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.pfcp_addr, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(args.pfcp_port, Some(8806));
        assert_eq!(args.node_id.as_deref(), Some("upf1.example.org"));
        assert_eq!(args.n3_addr, Some(Ipv4Addr::new(192, 168, 1, 10)));
    }

    #[test]
    fn test_args_no_color() {
        let args = Args::parse_from(["n4-upfd", "-m"]);
        assert!(args.no_color);
    }

    #[test]
    fn test_args_rejects_bad_address() {
        assert!(Args::try_parse_from(["n4-upfd", "--n3-addr", "not-an-ip"]).is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let args = Args::parse_from([
            "n4-upfd",
            "--pfcp-port",
            "9805",
            "--node-id",
            "upf.test",
            "-e",
            "warn",
        ]);
        let mut config = UpfConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.pfcp.port, 9805);
        assert_eq!(config.node_id(), "upf.test");
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.n3.address, UpfConfig::default().n3.address);
    }
}
