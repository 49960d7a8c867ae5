//! Server configuration.
//!
//! Holds the parsed CLI options and the conversion helpers from
//! CLI-friendly strings (like "100M", "1G") to internal types.

use std::path::PathBuf;
use std::time::Duration;

use vesper_core::EvictionPolicy;
use vesper_persistence::FsyncPolicy;

/// Fully-parsed server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,

    pub tls: bool,
    pub mtls: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub client_ca_file: Option<String>,

    pub data_dir: PathBuf,
    pub aof_enabled: bool,
    pub aof_fsync: FsyncPolicy,
    pub restore_aof: bool,
    pub snapshot_enabled: bool,
    pub snapshot_interval: Duration,
    pub restore_snapshot: bool,

    pub max_memory: Option<usize>,
    pub eviction_policy: EvictionPolicy,
    pub eviction_interval: Duration,

    pub cluster: bool,
    pub server_id: String,
    pub raft_peers: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 7878,
            tls: false,
            mtls: false,
            cert_file: None,
            key_file: None,
            client_ca_file: None,
            data_dir: PathBuf::from("./data"),
            aof_enabled: false,
            aof_fsync: FsyncPolicy::EverySec,
            restore_aof: false,
            snapshot_enabled: false,
            snapshot_interval: Duration::from_secs(300),
            restore_snapshot: false,
            max_memory: None,
            eviction_policy: EvictionPolicy::NoEviction,
            eviction_interval: Duration::from_millis(100),
            cluster: false,
            server_id: "vesper-1".into(),
            raft_peers: Vec::new(),
        }
    }
}

/// Converts a byte-size argument such as `512`, `64k`, or `1gb` into a
/// byte count. The number is split from its trailing unit, and the
/// unit (case-insensitive, with or without a trailing `b`) selects a
/// binary shift: K = 2^10, M = 2^20, G = 2^30.
pub fn parse_byte_size(input: &str) -> Result<usize, String> {
    let trimmed = input.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(digits_end);

    let base: usize = digits
        .parse()
        .map_err(|_| format!("invalid byte size '{input}'"))?;

    let shift = match unit.to_ascii_lowercase().as_str() {
        "" => 0,
        "k" | "kb" => 10,
        "m" | "mb" => 20,
        "g" | "gb" => 30,
        other => return Err(format!("unknown byte-size unit '{other}' in '{input}'")),
    };

    base.checked_mul(1usize << shift)
        .ok_or_else(|| format!("byte size '{input}' overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_bytes() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parse_suffixes() {
        assert_eq!(parse_byte_size("100K").unwrap(), 100 * 1024);
        assert_eq!(parse_byte_size("100kb").unwrap(), 100 * 1024);
        assert_eq!(parse_byte_size("50M").unwrap(), 50 * 1024 * 1024);
        assert_eq!(parse_byte_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_invalid_is_error() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("abc").is_err());
        assert!(parse_byte_size("M").is_err());
    }

    #[test]
    fn default_config_is_standalone() {
        let cfg = ServerConfig::default();
        assert!(!cfg.cluster);
        assert!(!cfg.aof_enabled);
        assert_eq!(cfg.eviction_policy, vesper_core::EvictionPolicy::NoEviction);
    }
}
