use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ntp_logger::capture::{CaptureSource, LiveCapture, LiveCaptureConfig, PcapFileSource, UdpListener};
use ntp_logger::ntp::{ResponseParams, NTP_PORT};
use ntp_logger::output::{Clock, OutputConfig, OutputFormat, OutputManager, SystemClock};
use ntp_logger::pipeline::{drive_capture, HandlerConfig, OverflowPolicy, PacketHandler, PoolConfig, WorkerPool};
use ntp_logger::prefix::{IgnorePolicy, PrefixStore};
use ntp_logger::responder::{Responder, UdpResponder};

#[derive(Parser, Debug)]
#[command(name = "ntp-logger")]
#[command(about = "Log NTP client traffic from selected networks to daily capture or CSV files")]
#[command(version = "1.0.0")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sniff NTP traffic on a network interface
    Capture {
        /// Interface to capture on
        #[arg(short, long, default_value = "eth0")]
        interface: String,

        /// Put the interface into promiscuous mode
        #[arg(long)]
        promisc: bool,

        /// Bytes captured per frame
        #[arg(long, default_value = "1024")]
        snaplen: i32,

        /// BPF filter (default: udp dst port <port>)
        #[arg(long)]
        filter: Option<String>,
    },
    /// Process a recorded PCAP file
    Replay {
        /// Path to PCAP file
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Receive NTP requests on a bound UDP socket
    Listen {
        /// Address to bind
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Server address recorded as the destination in capture files
        #[arg(long)]
        server_ip: Option<Ipv4Addr>,
    },
}

#[derive(ClapArgs, Debug)]
struct CommonArgs {
    /// File with one IP prefix per line
    #[arg(long, global = true, default_value = "prefixes.txt")]
    prefixes: PathBuf,

    /// Directory for the daily output files
    #[arg(short, long, global = true, default_value = "output")]
    output: PathBuf,

    /// Output file name prefix
    #[arg(long, global = true, default_value = "ntp")]
    file_prefix: String,

    /// Output format: pcap or csv
    #[arg(long, global = true, default_value = "pcap")]
    format: OutputFormat,

    /// Site name written into the CSV region column
    #[arg(long, global = true, default_value = "default")]
    region: String,

    /// Monitored NTP port
    #[arg(short, long, global = true, default_value_t = NTP_PORT)]
    port: u16,

    /// Source address suffix to ignore (empty disables)
    #[arg(long, global = true, default_value = ".1")]
    ignore_suffix: String,

    /// Answer valid NTP requests with a server reply
    #[arg(long, global = true)]
    respond: bool,

    /// Local address for replies when not listening on a socket
    #[arg(long, global = true, default_value = "0.0.0.0:0")]
    respond_from: SocketAddr,

    /// Worker threads (default: number of CPUs)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Queue capacity between capture and workers
    #[arg(long, global = true, default_value = "100")]
    queue: usize,

    /// What to do when the queue is full: block or drop
    #[arg(long, global = true, default_value = "block")]
    overflow: OverflowPolicy,

    /// Rotate on UTC dates instead of local dates
    #[arg(long, global = true)]
    utc: bool,

    /// Stratum advertised in replies
    #[arg(long, global = true, default_value = "2")]
    stratum: u8,

    /// Poll exponent advertised in replies
    #[arg(long, global = true, default_value = "4", allow_hyphen_values = true)]
    poll: i8,

    /// Precision exponent advertised in replies
    #[arg(long, global = true, default_value = "-10", allow_hyphen_values = true)]
    precision: i8,

    /// Reference identifier advertised in replies
    #[arg(long, global = true, default_value = "132.239.1.6")]
    refid: Ipv4Addr,

    /// Seconds the reference timestamp lags the transmit time
    #[arg(long, global = true, default_value = "3600")]
    reference_offset: u64,

    /// Seconds between statistics lines
    #[arg(long, global = true, default_value = "10")]
    stats_interval: u64,

    /// Seconds between prefix file reloads, 0 to reload only on rotation
    #[arg(long, global = true, default_value = "0")]
    reload_interval: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl CommonArgs {
    fn response_params(&self) -> ResponseParams {
        ResponseParams {
            stratum: self.stratum,
            poll: self.poll,
            precision: self.precision,
            reference_id: self.refid.octets(),
            reference_offset: Duration::from_secs(self.reference_offset),
            ..ResponseParams::default()
        }
    }
}

/// Open the capture source. In listen mode the socket doubles as the reply
/// path, so its responder is handed back alongside it.
fn open_source(command: &Commands, port: u16) -> Result<(Box<dyn CaptureSource>, Option<UdpResponder>)> {
    match command {
        Commands::Capture { interface, promisc, snaplen, filter } => {
            let config = LiveCaptureConfig {
                interface: interface.clone(),
                snaplen: *snaplen,
                promiscuous: *promisc,
                filter: Some(filter.clone().unwrap_or_else(|| format!("udp dst port {}", port))),
                ..LiveCaptureConfig::default()
            };
            Ok((Box::new(LiveCapture::open(&config)?), None))
        }
        Commands::Replay { file } => Ok((Box::new(PcapFileSource::open(file)?), None)),
        Commands::Listen { bind, server_ip } => {
            let mut listener = UdpListener::bind(SocketAddr::new(*bind, port), Duration::from_secs(1))?;
            if let Some(ip) = server_ip {
                listener = listener.with_server_ip(*ip);
            } else if bind.is_unspecified() {
                warn!("Listening on a wildcard address without --server-ip, capture files will show 0.0.0.0 as destination");
            }
            let shared = listener.responder()?;
            Ok((Box::new(listener), Some(shared)))
        }
    }
}

// Local offset has to be read while the process is still single-threaded
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let common = &args.common;

    let level = if common.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let clock = if common.utc { SystemClock::utc() } else { SystemClock::local() };

    info!("Starting NTP logger");
    info!("Current time: {}", clock.now());

    let prefixes = Arc::new(
        PrefixStore::from_file(&common.prefixes)
            .with_context(|| format!("Cannot start without prefix list {}", common.prefixes.display()))?,
    );

    std::fs::create_dir_all(&common.output)
        .with_context(|| format!("Failed to create output directory {}", common.output.display()))?;

    let (mut source, listener_responder) = open_source(&args.command, common.port)?;
    info!("Capture source: {}", source.describe());

    let responder: Option<Arc<dyn Responder>> = if common.respond {
        let responder = match listener_responder {
            Some(shared) => shared,
            None => UdpResponder::bind(common.respond_from)?,
        };
        Some(Arc::new(responder))
    } else {
        None
    };

    let output = Arc::new(OutputManager::new(
        OutputConfig {
            directory: common.output.clone(),
            file_prefix: common.file_prefix.clone(),
            format: common.format,
            region: common.region.clone(),
            link_type: source.link_type(),
            snaplen: 65535,
        },
        Box::new(clock),
    ));
    if let Err(e) = output.ensure_current() {
        warn!("Initial output file not opened, will retry on first packet: {}", e);
    }

    let handler = Arc::new(PacketHandler::new(
        HandlerConfig {
            monitored_port: common.port,
            ignore: IgnorePolicy::new(common.ignore_suffix.clone()),
            response: common.response_params(),
        },
        output.clone(),
        prefixes.clone(),
        responder,
    ));

    let pool = WorkerPool::start(
        &PoolConfig {
            workers: common.workers.unwrap_or_else(num_cpus::get),
            queue_capacity: common.queue,
            overflow: common.overflow,
            ..PoolConfig::default()
        },
        handler,
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            info!("Received Ctrl+C, shutting down...");
            running.store(false, Ordering::Relaxed);
        });
    }

    let stats_handle = {
        let stats = pool.stats();
        let interval_secs = common.stats_interval.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                let s = stats.snapshot();
                info!(
                    "Received: {} - Logged: {} - Filtered: {} - Ignored: {} - Not NTP: {} - Responses: {} - Dropped: {} - Errors: {}",
                    s.received, s.logged, s.filtered, s.ignored, s.not_ntp, s.responses, s.dropped,
                    s.log_errors + s.send_errors
                );
            }
        })
    };

    let reload_handle = (common.reload_interval > 0).then(|| {
        let prefixes = prefixes.clone();
        let period = Duration::from_secs(common.reload_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = prefixes.reload() {
                    warn!("Keeping previous prefix list, reload failed: {:#}", e);
                }
            }
        })
    });

    let start_time = Instant::now();
    let (pool, read) = {
        let running = running.clone();
        tokio::task::spawn_blocking(move || {
            let read = drive_capture(source.as_mut(), &pool, &running);
            (pool, read)
        })
        .await
        .context("Capture thread panicked")?
    };

    let (read, capture_error) = match read {
        Ok(count) => (count, None),
        Err(e) => {
            error!("Capture stopped: {:#}", e);
            (0, Some(e))
        }
    };

    info!("Capture finished, draining workers...");
    let totals = pool.shutdown();
    stats_handle.abort();
    if let Some(handle) = reload_handle {
        handle.abort();
    }

    if let Err(e) = output.close() {
        warn!("Error closing output file: {}", e);
    }

    info!("Final statistics:");
    info!("  Datagrams read: {}", read);
    info!("  Logged: {} ({} failed)", totals.logged, totals.log_errors);
    info!("  Filtered: {}, ignored: {}, not NTP: {}", totals.filtered, totals.ignored, totals.not_ntp);
    info!("  Responses sent: {} ({} failed)", totals.responses, totals.send_errors);
    info!("  Dropped on overflow: {}", totals.dropped);
    info!("  Output files created: {}", output.files_created());
    info!("  Duration: {:.2} seconds", start_time.elapsed().as_secs_f64());

    // Whatever was queued has been drained and flushed; now report the failure
    match capture_error {
        Some(e) => Err(e.context("Capture source failed")),
        None => Ok(()),
    }
}
