use clap::{Parser, Subcommand, ValueEnum};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use tracing::{error, info, warn, Level};
use udp_probe::collaborators::capture::{CaptureController, NoCapture, TcpdumpCapture};
use udp_probe::collaborators::id_allocator::FileIdAllocator;
use udp_probe::collaborators::metrics_sink::JsonFileSink;
use udp_probe::config::{ProbeConfig, TestParams, DEFAULT_PORT};
use udp_probe::engine::end_point::{Requester, Responder, RunReport};
use udp_probe::error::ProbeError;
use udp_probe::fault;
use udp_probe::protocol::frame::Direction;
use udp_probe::stats;

const EXIT_INTERRUPTED: u8 = 2;

#[derive(Parser)]
#[clap(name = "udp-probe", about = "measures UDP throughput and packet loss between two endpoints")]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[clap(long, global = true, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// serve upload and download sessions until interrupted
    Server {
        #[clap(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,

        #[clap(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[clap(long, default_value = "data")]
        out_dir: PathBuf,

        /// run tcpdump per session, writing the captures to this directory
        #[clap(long)]
        capture_dir: Option<PathBuf>,

        /// idle time in seconds after which a session is evicted
        #[clap(long, default_value_t = 30)]
        session_timeout: u64,
    },
    /// run a single test against a server
    Client {
        #[clap(short = 'z', long)]
        host: String,

        #[clap(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[clap(short = 'n', long, default_value_t = 60)]
        npackets: u32,

        /// packets per second
        #[clap(short, long, default_value_t = 1)]
        rate: u32,

        #[clap(short, long, value_enum)]
        direction: DirectionArg,

        /// local address, defaults to the server's port on all interfaces
        #[clap(short, long)]
        bind: Option<SocketAddr>,

        #[clap(long, default_value = "used_ids.txt")]
        id_file: PathBuf,

        #[clap(long, default_value = "data")]
        out_dir: PathBuf,
    },
    /// aggregate a saved server snapshot's upload sessions into a CSV file
    Stats {
        input: PathBuf,

        #[clap(short, long, default_value = "results.csv")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Up,
    Down,
}
impl From<DirectionArg> for Direction {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Up => Direction::Upload,
            DirectionArg::Down => Direction::Download,
        }
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    fault::install_panic_hook();

    let result = match args.command {
        Command::Server { bind, port, out_dir, capture_dir, session_timeout } => {
            run_server(SocketAddr::new(bind, port), out_dir, capture_dir, Duration::from_secs(session_timeout)).await
        }
        Command::Stats { input, output } => {
            stats::convert(&input, &output).map(|_| ExitCode::SUCCESS)
        }
        Command::Client { host, port, npackets, rate, direction, bind, id_file, out_dir } => {
            let bind = bind.unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
            run_client(&host, port, npackets, rate, direction.into(), bind, id_file, out_dir).await
        }
    };

    match result {
        Ok(exit_code) => exit_code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(bind_addr: SocketAddr, out_dir: PathBuf, capture_dir: Option<PathBuf>, session_timeout: Duration) -> anyhow::Result<ExitCode> {
    let mut config = ProbeConfig::default_for(bind_addr);
    config.session_timeout = session_timeout;

    let sink = Arc::new(JsonFileSink::new(&out_dir, "server")?);
    let capture: Arc<dyn CaptureController> = match capture_dir {
        Some(dir) => Arc::new(TcpdumpCapture::new(dir)?),
        None => Arc::new(NoCapture),
    };

    let responder = Responder::start(config, sink, capture).await?;
    tokio::signal::ctrl_c().await?;
    info!("interrupted - shutting down");
    responder.stop().await?;
    Ok(ExitCode::from(EXIT_INTERRUPTED))
}

#[allow(clippy::too_many_arguments)]
async fn run_client(host: &str, port: u16, npackets: u32, rate: u32, direction: Direction, bind_addr: SocketAddr, id_file: PathBuf, out_dir: PathBuf) -> anyhow::Result<ExitCode> {
    let server = tokio::net::lookup_host((host, port)).await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow!("no IPv4 address for {}", host))?;

    let params = TestParams::new(rate, npackets, direction)?;
    let mut allocator = FileIdAllocator::open(&id_file)?;
    let sink = Arc::new(JsonFileSink::new(&out_dir, "client")?);

    match Requester::run_until(ProbeConfig::default_for(bind_addr), server, params, &mut allocator, sink, interrupted()).await {
        Ok(report) => {
            log_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => match e.downcast_ref::<ProbeError>() {
            Some(ProbeError::Interrupted { .. }) => {
                warn!("{}", e);
                Ok(ExitCode::from(EXIT_INTERRUPTED))
            }
            _ => Err(e),
        }
    }
}

/// Completes on ctrl-c. If the signal handler can't be installed, it never completes.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("unable to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

fn log_report(report: &RunReport) {
    info!("session {} ({:?}): {:?}", report.session_id, report.direction, report.state);
    match report.direction {
        Direction::Upload => info!("sent {} of {} packets", report.record.sent, report.record.total_packets),
        Direction::Download => {
            info!("received {} of {} packets, {} duplicates", report.record.count, report.record.total_packets, report.record.duplicates);
            if let Some(missing) = &report.missing_ranges {
                if !missing.is_empty() {
                    let formatted = missing.iter()
                        .map(|(from, to)| if from == to { from.to_string() } else { format!("{}-{}", from, to) })
                        .collect::<Vec<_>>();
                    info!("missing: {}", formatted.join(", "));
                }
            }
        }
    }
}
