//! Orchestrates an external port-scanner subprocess (zmap) and parses its
//! output into candidates. `spec.md` §4.2. The driver never links against
//! a scanner implementation; it supervises a subprocess, per §9 "External
//! process as a collaborator, not a library".

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ZmapConfig;
use crate::types::{Candidate, Protocol};

/// Exhaustive port → protocol mapping, per §4.2.
fn port_protocol(port: u16) -> Protocol {
    match port {
        80 | 8080 | 3128 | 8888 | 9090 => Protocol::Http,
        1080 => Protocol::Socks5,
        1081 => Protocol::Socks4,
        _ => Protocol::Http,
    }
}

#[derive(Debug, Default)]
pub struct ScannerStats {
    pub last_scan_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_scan_duration_secs: f64,
    pub candidates_found: u64,
    pub total_scans: u64,
    pub per_port: std::collections::HashMap<u16, (u64, u64)>, // (success, error)
}

pub struct ScannerDriver {
    config: ZmapConfig,
    pub stats: Arc<std::sync::Mutex<ScannerStats>>,
}

impl ScannerDriver {
    /// Pre-flight checks, per §4.2. Returns `None` (never an error) when any
    /// check fails. Scanning is disabled for the session and the caller
    /// removes the driver from the pipeline.
    pub fn new(config: ZmapConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        if let Err(e) = preflight(&config) {
            warn!(error = %e, "zmap pre-flight failed, disabling scanner for this session");
            return None;
        }
        Some(Self {
            config,
            stats: Arc::new(std::sync::Mutex::new(ScannerStats::default())),
        })
    }

    /// Runs one scan across every configured port and returns the
    /// deduplicated union, per §4.2 "Contract".
    pub async fn scan(&self) -> Vec<Candidate> {
        let start = std::time::Instant::now();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for &port in &self.config.ports {
            let addrs = self.scan_port(port).await;
            let found = addrs.len() as u64;
            {
                let mut stats = self.stats.lock().unwrap();
                let entry = stats.per_port.entry(port).or_insert((0, 0));
                if found > 0 {
                    entry.0 += found;
                } else {
                    entry.1 += 1;
                }
            }
            let protocol = port_protocol(port);
            for addr in addrs {
                let candidate = Candidate::new(format!("{addr}:{port}"), protocol);
                if seen.insert(candidate.key()) {
                    out.push(candidate);
                }
            }
        }

        let mut stats = self.stats.lock().unwrap();
        stats.last_scan_time = Some(chrono::Utc::now());
        stats.last_scan_duration_secs = start.elapsed().as_secs_f64();
        stats.candidates_found = out.len() as u64;
        stats.total_scans += 1;

        out
    }

    /// A point-in-time snapshot for `GET /stats/zmap`.
    pub fn stats_view(&self) -> ZmapStatsView {
        let stats = self.stats.lock().unwrap();
        ZmapStatsView {
            enabled: self.config.enabled,
            ports: self.config.ports.clone(),
            last_scan_time: stats.last_scan_time,
            last_scan_duration: stats.last_scan_duration_secs,
            candidates_found: stats.candidates_found,
            total_scans: stats.total_scans,
        }
    }

    async fn scan_port(&self, port: u16) -> Vec<std::net::Ipv4Addr> {
        let outfile = std::env::temp_dir().join(format!("proxy-pool-zmap-{port}-{}.csv", uuid::Uuid::new_v4()));
        let args = build_args(&self.config, port, &outfile);

        debug!(port, args = ?args, "launching zmap");

        let mut child = match Command::new(&self.config.zmap_binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(port, error = %e, "failed to spawn zmap");
                return Vec::new();
            }
        };

        let deadline = Duration::from_secs(self.config.max_runtime_seconds);
        match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                if !status.success() {
                    warn!(port, %status, "zmap exited non-zero");
                }
            }
            Ok(Err(e)) => warn!(port, error = %e, "zmap wait() failed"),
            Err(_) => {
                warn!(port, seconds = self.config.max_runtime_seconds, "zmap exceeded deadline, killing");
                let _ = child.kill().await;
            }
        }

        parse_csv_output(&outfile).await.unwrap_or_else(|e| {
            warn!(port, error = %e, "failed to parse zmap output");
            Vec::new()
        })
    }
}

fn build_args(config: &ZmapConfig, port: u16, outfile: &Path) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        port.to_string(),
        "-r".to_string(),
        config.rate_limit.to_string(),
        "-o".to_string(),
        outfile.display().to_string(),
        "--output-fields=saddr".to_string(),
        "--output-module=csv".to_string(),
    ];
    if !config.bandwidth.is_empty() {
        args.push("-B".to_string());
        args.push(config.bandwidth.clone());
    }
    args.push("-T".to_string());
    args.push(config.max_runtime_seconds.to_string());
    for bl in &config.blacklist {
        args.push("-b".to_string());
        args.push(bl.clone());
    }
    if let Some(iface) = &config.interface {
        args.push("-i".to_string());
        args.push(iface.clone());
    }
    if config.target_ranges.is_empty() {
        warn!("zmap.target_ranges is empty: scanning the entire IPv4 address space");
    } else {
        args.extend(config.target_ranges.iter().cloned());
    }
    args
}

async fn parse_csv_output(path: &PathBuf) -> anyhow::Result<Vec<std::net::Ipv4Addr>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(_) => return Ok(Vec::new()), // partial/never-written output is not fatal
    };
    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    let mut header_skipped = false;
    while let Some(line) = lines.next_line().await? {
        if !header_skipped {
            header_skipped = true;
            if line.trim().eq_ignore_ascii_case("saddr") {
                continue;
            }
        }
        if let Ok(ip) = line.trim().parse::<std::net::Ipv4Addr>() {
            out.push(ip);
        }
    }
    let _ = tokio::fs::remove_file(path).await;
    Ok(out)
}

fn preflight(config: &ZmapConfig) -> anyhow::Result<()> {
    let binary_path = which(&config.zmap_binary)
        .ok_or_else(|| anyhow::anyhow!("zmap binary '{}' not found on PATH", config.zmap_binary))?;

    let meta = std::fs::metadata(&binary_path)?;
    if meta.permissions().mode() & 0o111 == 0 {
        anyhow::bail!("zmap binary at {} is not executable", binary_path.display());
    }

    if !has_raw_socket_capability(&binary_path) {
        anyhow::bail!("zmap lacks raw-socket capability (not root and no CAP_NET_RAW on binary)");
    }

    for &p in &config.ports {
        if p == 0 {
            anyhow::bail!("zmap port 0 is out of range [1, 65535]");
        }
    }
    if config.rate_limit == 0 || config.rate_limit > 1_000_000 {
        anyhow::bail!("zmap rate_limit {} out of range [1, 1000000]", config.rate_limit);
    }
    if config.max_runtime_seconds == 0 || config.max_runtime_seconds > 86_400 {
        anyhow::bail!(
            "zmap max_runtime_seconds {} out of range [1, 86400]",
            config.max_runtime_seconds
        );
    }
    Ok(())
}

fn which(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let p = PathBuf::from(binary);
        return p.is_file().then_some(p);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|p| p.is_file())
}

/// Checks effective-uid-is-zero, or (as a fallback) that the binary carries
/// a `security.capability` xattr. The two mechanisms named in §4.2.
fn has_raw_socket_capability(binary_path: &PathBuf) -> bool {
    if is_root() {
        return true;
    }
    std::fs::metadata(binary_path)
        .map(|_| xattr_capability_present(binary_path))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

fn xattr_capability_present(path: &PathBuf) -> bool {
    // `getxattr` probing without a dedicated crate: the presence of the
    // extended attribute is enough, its content is not interpreted.
    std::process::Command::new("getcap")
        .arg(path)
        .output()
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}

/// Stats surfaced via `GET /stats/zmap`, per §6.
pub struct ZmapStatsView {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub last_scan_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_scan_duration: f64,
    pub candidates_found: u64,
    pub total_scans: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_protocol_mapping_is_exhaustive_per_spec() {
        assert_eq!(port_protocol(80), Protocol::Http);
        assert_eq!(port_protocol(8080), Protocol::Http);
        assert_eq!(port_protocol(3128), Protocol::Http);
        assert_eq!(port_protocol(8888), Protocol::Http);
        assert_eq!(port_protocol(9090), Protocol::Http);
        assert_eq!(port_protocol(1080), Protocol::Socks5);
        assert_eq!(port_protocol(1081), Protocol::Socks4);
        assert_eq!(port_protocol(31337), Protocol::Http); // unknown defaults to http
    }

    #[test]
    fn build_args_includes_required_flags() {
        let cfg = ZmapConfig {
            enabled: true,
            ports: vec![1080],
            rate_limit: 5_000,
            bandwidth: String::new(),
            max_runtime_seconds: 120,
            target_ranges: vec!["10.0.0.0/8".to_string()],
            blacklist: vec!["blacklist.conf".to_string()],
            interface: None,
            zmap_binary: "zmap".to_string(),
            cooldown_seconds: 0,
        };
        let args = build_args(&cfg, 1080, &PathBuf::from("/tmp/out.csv"));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"1080".to_string()));
        assert!(args.contains(&"--output-module=csv".to_string()));
        assert!(args.contains(&"10.0.0.0/8".to_string()));
        assert!(args.contains(&"blacklist.conf".to_string()));
    }

    #[test]
    fn preflight_rejects_out_of_range_rate_limit() {
        let cfg = ZmapConfig {
            enabled: true,
            ports: vec![80],
            rate_limit: 2_000_000,
            bandwidth: String::new(),
            max_runtime_seconds: 60,
            target_ranges: Vec::new(),
            blacklist: Vec::new(),
            interface: None,
            zmap_binary: "zmap".to_string(),
            cooldown_seconds: 0,
        };
        assert!(ScannerDriver::new(cfg).is_none());
    }
}
