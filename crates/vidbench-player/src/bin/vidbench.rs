//! # vidbench
//!
//! Runs one adaptive-streaming scenario and writes its telemetry.
//!
//! ```bash
//! # In-process, on the emulated link
//! vidbench simulate -b 2 -d 80 -j 30 -l 3 -t worst --out results/worst
//!
//! # Real link: netem on veth0, servers on 10.0.0.2
//! vidbench run --iface veth0 --http-url http://10.0.0.2:8080 \
//!   --udp-addr 10.0.0.2:4433 --iperf-server 10.0.0.2 -b 20 -d 10
//! ```
//!
//! Output: `events.jsonl` (one telemetry record per line) and
//! `summary.json` in the `--out` directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vidbench_common::manifest::Manifest;
use vidbench_common::profile::ScenarioParams;
use vidbench_player::config::PlayerConfig;
use vidbench_player::fetch::{self, HttpFetcher, SegmentFetcher, Transport, UdpFetcher};
use vidbench_player::telemetry::JsonlSink;
use vidbench_player::{ExecutionMode, ScenarioReport, ScenarioRunner};
use vidbench_sim::cross_traffic::{CrossTrafficGenerator, IperfCrossTraffic};
use vidbench_sim::emulated::EmulatedLink;
use vidbench_sim::impairment::{LinkShaper, NetemShaper};
use vidbench_sim::topology::LinkHandle;

/// Default ladder when no manifest is given.
const DEFAULT_LADDER: [(u64, &str); 3] = [(1_000_000, "360p"), (3_000_000, "720p"), (6_000_000, "1080p")];
const DEFAULT_SEGMENT_SECS: u64 = 2;

#[derive(Parser, Debug)]
#[command(name = "vidbench", about = "Compare TCP and UDP adaptive streaming under shaped links")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Shape a real interface and stream from running segment servers.
    Run(RunArgs),
    /// Run the scenario in-process on an emulated link.
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct ScenarioArgs {
    /// Link bandwidth in Mbit/s.
    #[arg(short = 'b', long, default_value_t = 20.0)]
    bandwidth: f64,

    /// One-way delay in ms.
    #[arg(short = 'd', long, default_value_t = 10.0)]
    delay: f64,

    /// Delay jitter in ms.
    #[arg(short = 'j', long, default_value_t = 0.0)]
    jitter: f64,

    /// Packet loss in percent.
    #[arg(short = 'l', long, default_value_t = 0.0)]
    loss: f64,

    /// Cross traffic: none, random or worst.
    #[arg(short = 't', long = "cross-traffic", default_value = "none")]
    cross_traffic: String,
}

impl ScenarioArgs {
    fn params(&self) -> ScenarioParams {
        ScenarioParams {
            bandwidth_mbps: self.bandwidth,
            delay_ms: self.delay,
            jitter_ms: self.jitter,
            loss_pct: self.loss,
            cross_traffic: self.cross_traffic.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Manifest document (TOML or JSON). Defaults to a 1/3/6 Mbit/s ladder.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Segment count of the default ladder.
    #[arg(long, default_value_t = 30)]
    segments: u32,

    /// Player configuration (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory for events.jsonl and summary.json.
    #[arg(long, default_value = "results")]
    out: PathBuf,

    /// Transports to compare.
    #[arg(long, value_delimiter = ',', default_value = "tcp,udp")]
    transports: Vec<Transport>,

    /// Run the transports one after the other instead of side by side.
    #[arg(long, default_value_t = false)]
    sequential: bool,

    /// Seed for jitter and random cross traffic.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    #[command(flatten)]
    common: CommonArgs,

    /// Interface to shape.
    #[arg(long)]
    iface: String,

    /// Network namespace holding the interface.
    #[arg(long)]
    netns: Option<String>,

    /// Base URL of the HTTP segment server.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    http_url: String,

    /// Address of the UDP segment server.
    #[arg(long, default_value = "127.0.0.1:4433")]
    udp_addr: SocketAddr,

    /// iperf3 server for cross traffic.
    #[arg(long, default_value = "127.0.0.1")]
    iperf_server: String,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    #[command(flatten)]
    common: CommonArgs,
}

fn load_manifest(common: &CommonArgs) -> anyhow::Result<Arc<Manifest>> {
    let manifest = match &common.manifest {
        Some(path) => Manifest::load(path)
            .with_context(|| format!("loading manifest {}", path.display()))?,
        None => Manifest::from_ladder(
            Duration::from_secs(DEFAULT_SEGMENT_SECS),
            common.segments,
            &DEFAULT_LADDER,
        )?,
    };
    Ok(Arc::new(manifest))
}

fn load_config(common: &CommonArgs) -> anyhow::Result<PlayerConfig> {
    match &common.config {
        Some(path) => PlayerConfig::load(path)
            .with_context(|| format!("loading player config {}", path.display())),
        None => Ok(PlayerConfig::default()),
    }
}

fn mode(common: &CommonArgs) -> ExecutionMode {
    if common.sequential {
        ExecutionMode::Sequential
    } else {
        ExecutionMode::Concurrent
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received SIGINT, aborting scenario");
            token.cancel();
        }
    });
}

async fn execute<S: LinkShaper, C: CrossTrafficGenerator>(
    shaper: S,
    cross_traffic: C,
    scenario: &ScenarioArgs,
    common: &CommonArgs,
    manifest: Arc<Manifest>,
    config: PlayerConfig,
    fetchers: Vec<Box<dyn SegmentFetcher>>,
) -> anyhow::Result<ScenarioReport> {
    let sink = Arc::new(JsonlSink::create(&common.out.join("events.jsonl"))?);
    let mut runner = ScenarioRunner::new(shaper, cross_traffic, manifest, config, sink)
        .with_mode(mode(common));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = runner.run(&scenario.params(), fetchers, cancel).await?;
    report.write_summary(&common.out.join("summary.json"))?;
    Ok(report)
}

async fn run(args: RunArgs) -> anyhow::Result<ScenarioReport> {
    let manifest = load_manifest(&args.common)?;
    let config = load_config(&args.common)?;

    let mut fetchers: Vec<Box<dyn SegmentFetcher>> = Vec::new();
    for transport in &args.common.transports {
        match transport {
            Transport::Tcp => fetchers.push(Box::new(HttpFetcher::new(
                &args.http_url,
                config.transport.tcp_timeout,
                config.transport.http_reuse_connections,
            )?)),
            Transport::Udp => fetchers.push(Box::new(
                UdpFetcher::connect(
                    args.udp_addr,
                    config.transport.udp_timeout,
                    config.transport.udp_nack_interval,
                )
                .await
                .with_context(|| format!("connecting to {}", args.udp_addr))?,
            )),
        }
    }

    let link = match &args.netns {
        Some(ns) => LinkHandle::in_namespace(&args.iface, ns),
        None => LinkHandle::new(&args.iface),
    };
    let shaper = NetemShaper::new(link.clone());
    let cross_traffic = IperfCrossTraffic::new(link, &args.iperf_server, args.common.seed);

    execute(
        shaper,
        cross_traffic,
        &args.scenario,
        &args.common,
        manifest,
        config,
        fetchers,
    )
    .await
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<ScenarioReport> {
    let manifest = load_manifest(&args.common)?;
    let config = load_config(&args.common)?;

    let link = EmulatedLink::new(args.common.seed);
    let fetchers = fetch::emulated::fetchers(
        &link,
        &manifest,
        &config.transport,
        &args.common.transports,
    );

    execute(
        link.shaper(),
        link.cross_traffic(args.common.seed),
        &args.scenario,
        &args.common,
        manifest,
        config,
        fetchers,
    )
    .await
}

fn print_report(report: &ScenarioReport, out: &Path) {
    println!("run {} ({}, {})", report.run_id, report.profile, report.mode);
    for s in &report.sessions {
        let summary = &s.summary;
        println!(
            "  {:<4} {:<9} startup={:>8} stalls={:<3} stalled={:>8.0}ms switches={:<3} max_buffer={:>6.0}ms mean_bitrate={}",
            summary.transport.to_string(),
            format!("{:?}", s.state).to_lowercase(),
            summary
                .startup_delay_ms
                .map(|ms| format!("{ms:.0}ms"))
                .unwrap_or_else(|| "-".into()),
            summary.stall_count,
            summary.total_stall_ms,
            summary.quality_switches,
            summary.max_buffer_ms,
            summary
                .mean_bitrate_bps
                .map(|b| format!("{:.2}Mbit/s", b / 1e6))
                .unwrap_or_else(|| "-".into()),
        );
    }
    println!("telemetry written to {}", out.display());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (report, out) = match cli.command {
        Command::Run(args) => {
            let out = args.common.out.clone();
            (run(args).await?, out)
        }
        Command::Simulate(args) => {
            let out = args.common.out.clone();
            (simulate(args).await?, out)
        }
    };

    print_report(&report, &out);
    if !report.all_finished() {
        tracing::warn!(run = %report.run_id, "not every session finished");
    }
    Ok(())
}
