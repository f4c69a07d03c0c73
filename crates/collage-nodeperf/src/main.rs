//! Object replication throughput measurement.
//!
//! One process runs as the master, committing versions of a payload object
//! as fast as slaves allow; any number of client processes map the object
//! and sync versions, reporting throughput per interval.

use anyhow::Context;
use clap::Parser;
use rand::RngCore;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use collage::{ChangeType, DataIStream, DataOStream, Globals, LocalNode, Object, ObjectHandle,
    Version};

/// The well-known id under which the payload object is registered.
const PERF_OBJECT_ID: Uuid = Uuid::from_u128(0xc011a6e0_0e4f_0b1e_c700_000000000001);

/// Measure object replication throughput between collage nodes.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "NODEPERF_LISTEN", default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Address of the master process; when absent, run as the master.
    #[arg(long, env = "NODEPERF_MASTER")]
    master: Option<SocketAddr>,

    /// Payload bytes per object version.
    #[arg(long, env = "NODEPERF_OBJECT_SIZE", default_value = "1048576")]
    object_size: usize,

    /// How long to run.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    duration: Duration,

    /// Reporting interval.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    report_interval: Duration,

    /// Versions the master retains for late-joining slaves.
    #[arg(long, default_value = "16")]
    retained_versions: u32,
}

struct Payload {
    data: Vec<u8>,
    dirty: bool,
}

impl Payload {
    fn sized(object_size: usize) -> Payload {
        Payload {
            data: vec![0u8; object_size],
            dirty: false,
        }
    }

    fn mutate(&mut self) {
        let n = self.data.len().min(64);
        rand::thread_rng().fill_bytes(&mut self.data[..n]);
        self.dirty = true;
    }
}

impl Object for Payload {
    fn change_type(&self) -> ChangeType {
        ChangeType::Instance
    }

    fn get_instance_data(&mut self, os: &mut DataOStream) {
        os.write(&self.data);
        self.dirty = false;
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> collage::Result<()> {
        self.data = is.read()?;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let node = LocalNode::new(Globals::from_env());
    let addr = node
        .listen(cli.listen)
        .await
        .context("binding the listener")?;
    tracing::info!(%addr, node = %node.id(), "node up");

    match cli.master {
        None => run_master(&node, &cli).await,
        Some(master) => run_slave(&node, master, &cli).await,
    }
}

async fn run_master(node: &LocalNode, cli: &Cli) -> anyhow::Result<()> {
    let handle = ObjectHandle::new(Payload::sized(cli.object_size));
    node.register_object_with_id(&handle, PERF_OBJECT_ID)
        .await
        .context("registering the payload object")?;
    handle.set_auto_obsolete(cli.retained_versions);
    tracing::info!(id = %PERF_OBJECT_ID, size = cli.object_size, "payload registered");

    let started = Instant::now();
    let mut committed = 0u64;
    let mut window_start = Instant::now();
    let mut window_versions = 0u64;

    while started.elapsed() < cli.duration {
        handle.with_mut(Payload::mutate);
        let version = handle.commit().await.context("commit")?;
        committed += 1;
        window_versions += 1;

        if window_start.elapsed() >= cli.report_interval {
            report("commit", window_versions, cli.object_size, window_start);
            tracing::debug!(%version, "head advanced");
            window_start = Instant::now();
            window_versions = 0;
        }
        tokio::task::yield_now().await;
    }

    tracing::info!(committed, "master done");
    node.close().await;
    Ok(())
}

async fn run_slave(node: &LocalNode, master: SocketAddr, cli: &Cli) -> anyhow::Result<()> {
    let peer = node.connect(master).await.context("connecting master")?;
    let handle = ObjectHandle::new(Payload::sized(0));
    node.map_object_to(&handle, PERF_OBJECT_ID, Version::HEAD, peer.id())
        .await
        .context("mapping the payload object")?;
    tracing::info!(version = %handle.version(), "mapped");

    let started = Instant::now();
    let mut synced = 0u64;
    let mut window_start = Instant::now();
    let mut window_versions = 0u64;

    while started.elapsed() < cli.duration {
        let sync = tokio::time::timeout(cli.report_interval, handle.sync(Version::NEXT)).await;
        match sync {
            Ok(version) => {
                version.context("sync")?;
                synced += 1;
                window_versions += 1;
            }
            Err(_) => {} // idle interval, just report
        }
        if window_start.elapsed() >= cli.report_interval {
            report("sync", window_versions, cli.object_size, window_start);
            window_start = Instant::now();
            window_versions = 0;
        }
    }

    tracing::info!(synced, "slave done");
    node.unmap_object(&handle).await.ok();
    node.close().await;
    Ok(())
}

fn report(op: &str, versions: u64, object_size: usize, since: Instant) {
    let elapsed = since.elapsed().as_secs_f64();
    let mb = versions as f64 * object_size as f64 / (1024.0 * 1024.0);
    tracing::info!(
        op,
        versions,
        throughput = format!("{:.1} MB/s", mb / elapsed),
        rate = format!("{:.0}/s", versions as f64 / elapsed),
    );
}
