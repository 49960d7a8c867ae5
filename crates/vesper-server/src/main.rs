//! vesper-server: RESP-compatible in-memory key/value server.

mod acl;
mod commands;
mod config;
mod connection;
mod dispatch;
mod pubsub;
mod server;
mod state;
mod tls;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use vesper_core::EvictionPolicy;
use vesper_persistence::FsyncPolicy;

use crate::config::ServerConfig;

/// RESP-compatible in-memory key/value server.
#[derive(Parser)]
#[command(name = "vesper-server", version, about)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    bind_addr: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 7878)]
    port: u16,

    /// Enable TLS termination.
    #[arg(long)]
    tls: bool,

    /// Enable mutual TLS (implies --tls; requires --client-ca-file).
    #[arg(long)]
    mtls: bool,

    /// Server certificate (PEM).
    #[arg(long)]
    cert_file: Option<String>,

    /// Server private key (PEM).
    #[arg(long)]
    key_file: Option<String>,

    /// CA bundle for verifying client certificates.
    #[arg(long)]
    client_ca_file: Option<String>,

    /// Directory for the preamble, append log, and snapshots.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Enable the append-only file.
    #[arg(long)]
    aof: bool,

    /// AOF fsync strategy: always, everysec, or no.
    #[arg(long, default_value = "everysec")]
    aof_fsync: String,

    /// Restore from the AOF on startup.
    #[arg(long)]
    restore_aof: bool,

    /// Enable periodic snapshots.
    #[arg(long)]
    snapshot: bool,

    /// Seconds between periodic snapshots.
    #[arg(long, default_value_t = 300)]
    snapshot_interval_secs: u64,

    /// Restore from the newest snapshot on startup (ignored when
    /// --restore-aof is set).
    #[arg(long)]
    restore_snapshot: bool,

    /// Memory limit before eviction kicks in, e.g. "100M" or "2G".
    #[arg(long)]
    max_memory: Option<String>,

    /// Eviction policy: noeviction, allkeys-lru, volatile-lru,
    /// allkeys-lfu, volatile-lfu, volatile-ttl, allkeys-random, or
    /// volatile-random.
    #[arg(long, default_value = "noeviction")]
    eviction_policy: String,

    /// Milliseconds between TTL reaper passes.
    #[arg(long, default_value_t = 100)]
    eviction_interval_ms: u64,

    /// Run in cluster mode with Raft-replicated writes.
    #[arg(long)]
    cluster: bool,

    /// Identity of this server within the cluster.
    #[arg(long, default_value = "vesper-1")]
    server_id: String,

    /// Raft peer address; repeat for each peer.
    #[arg(long = "raft-peer")]
    raft_peers: Vec<String>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, String> {
        let eviction_policy: EvictionPolicy = self.eviction_policy.parse()?;
        let aof_fsync: FsyncPolicy = self.aof_fsync.parse()?;
        let max_memory = self
            .max_memory
            .as_deref()
            .map(config::parse_byte_size)
            .transpose()?;

        Ok(ServerConfig {
            bind_addr: self.bind_addr,
            port: self.port,
            tls: self.tls || self.mtls,
            mtls: self.mtls,
            cert_file: self.cert_file,
            key_file: self.key_file,
            client_ca_file: self.client_ca_file,
            data_dir: self.data_dir,
            aof_enabled: self.aof,
            aof_fsync,
            restore_aof: self.restore_aof,
            snapshot_enabled: self.snapshot,
            snapshot_interval: Duration::from_secs(self.snapshot_interval_secs),
            restore_snapshot: self.restore_snapshot,
            max_memory,
            eviction_policy,
            eviction_interval: Duration::from_millis(self.eviction_interval_ms),
            cluster: self.cluster,
            server_id: self.server_id,
            raft_peers: self.raft_peers,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vesper=info".into()),
        )
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal server error: {e}");
            ExitCode::FAILURE
        }
    }
}
