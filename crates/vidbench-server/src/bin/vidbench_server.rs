//! # vidbench-server
//!
//! Serves one content ladder over both transports.
//!
//! ```bash
//! # Synthetic payloads for the default 1/3/6 Mbit/s ladder
//! vidbench-server --http 10.0.0.2:8080 --udp 10.0.0.2:4433
//!
//! # Encoded segments from disk ({root}/{quality_id}/seg_{index:05}.m4s)
//! vidbench-server --manifest ladder.toml --segments-dir ./dash_content
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vidbench_common::manifest::Manifest;
use vidbench_server::{DirStore, SegmentStore, SyntheticStore, UdpSegmentServer, http};

#[derive(Parser, Debug)]
#[command(name = "vidbench-server", about = "HTTP and UDP segment servers for vidbench")]
struct Cli {
    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    http: SocketAddr,

    /// UDP listen address.
    #[arg(long, default_value = "0.0.0.0:4433")]
    udp: SocketAddr,

    /// Manifest document (TOML or JSON). Defaults to a 1/3/6 Mbit/s ladder.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Segment count of the default ladder.
    #[arg(long, default_value_t = 30)]
    segments: u32,

    /// Serve segment files from this directory instead of synthetic payloads.
    #[arg(long)]
    segments_dir: Option<PathBuf>,

    /// Payload bytes per UDP chunk.
    #[arg(long, default_value_t = vidbench_common::wire::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let manifest = Arc::new(match &cli.manifest {
        Some(path) => Manifest::load(path)
            .with_context(|| format!("loading manifest {}", path.display()))?,
        None => Manifest::from_ladder(
            Duration::from_secs(2),
            cli.segments,
            &[(1_000_000, "360p"), (3_000_000, "720p"), (6_000_000, "1080p")],
        )?,
    });

    let store: Arc<dyn SegmentStore> = match &cli.segments_dir {
        Some(dir) => Arc::new(DirStore::new(dir)),
        None => Arc::new(SyntheticStore::new(manifest.clone())),
    };
    for level in manifest.levels() {
        match store.list_segments(level.id) {
            Ok(segments) if segments.len() as u32 >= manifest.segment_count() => {}
            Ok(segments) => tracing::warn!(
                quality_id = level.id,
                available = segments.len(),
                expected = manifest.segment_count(),
                "quality level is missing segments"
            ),
            Err(e) => tracing::warn!(quality_id = level.id, error = %e, "quality level unavailable"),
        }
    }

    let shutdown = CancellationToken::new();

    let udp = UdpSegmentServer::bind(cli.udp, store.clone())
        .await
        .with_context(|| format!("binding UDP {}", cli.udp))?
        .with_chunk_size(cli.chunk_size);
    let udp_handle = tokio::spawn(udp.run(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(cli.http)
        .await
        .with_context(|| format!("binding HTTP {}", cli.http))?;
    tracing::info!(http = %cli.http, levels = manifest.levels().len(), "vidbench-server listening");
    let http_handle = tokio::spawn(http::serve(
        listener,
        http::router(store, manifest),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("received SIGINT, shutting down");
    shutdown.cancel();

    udp_handle.await??;
    http_handle.await??;
    Ok(())
}
