//! Per-protocol reachability check with concurrency, timeouts, and
//! retries. `spec.md` §4.5.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tokio_util::sync::CancellationToken;

use crate::config::{CheckerConfig, CheckerMode};
use crate::types::{Candidate, CheckResult, Protocol};

/// SOCKS checks get their own sub-limit so a slow SOCKS dialer that cannot
/// pool connections doesn't starve the HTTP checks, per §4.5 "Batch
/// execution".
const SOCKS_SUB_LIMIT: usize = 1_000;

pub struct Validator {
    config: Arc<CheckerConfig>,
}

/// Builds the per-candidate `reqwest::Client` template. A fresh client is
/// built for every HTTP check since `reqwest` binds its proxy at
/// client-construction time.
fn http_client_builder(config: &CheckerConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .http1_only()
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_millis(config.timeout_ms / 2))
}

impl Validator {
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Validates the whole candidate batch, producing exactly one
    /// `CheckResult` per candidate, per §4.5 "Contract".
    pub async fn validate_all(
        &self,
        candidates: Vec<Candidate>,
        cancel: CancellationToken,
    ) -> Vec<CheckResult> {
        let total_sem = Arc::new(Semaphore::new(self.config.concurrency_total.max(1)));
        let socks_sem = Arc::new(Semaphore::new(SOCKS_SUB_LIMIT));
        let mut set = JoinSet::new();

        for candidate in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let total_permit = match total_sem.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let config = self.config.clone();
            let socks_sem = socks_sem.clone();
            let cancel = cancel.clone();

            set.spawn(async move {
                let _total_permit = total_permit;
                if cancel.is_cancelled() {
                    return CheckResult::dead(candidate.address, candidate.protocol, "cancelled");
                }

                let is_socks = matches!(candidate.protocol, Protocol::Socks4 | Protocol::Socks5);
                if is_socks && !config.socks_enabled {
                    return CheckResult::dead(candidate.address, candidate.protocol, "socks checking disabled");
                }

                let _socks_permit = if is_socks {
                    socks_sem.acquire_owned().await.ok()
                } else {
                    None
                };

                check_with_retries(&candidate, &config, &cancel).await
            });
        }

        let mut results = Vec::new();
        while let Some(res) = set.join_next().await {
            if let Ok(result) = res {
                results.push(result);
            }
        }
        results
    }
}

async fn check_with_retries(
    candidate: &Candidate,
    config: &CheckerConfig,
    cancel: &CancellationToken,
) -> CheckResult {
    let mut last = check_once(candidate, config, cancel).await;
    let mut attempt = 0u32;
    while !last.alive && attempt < config.retries {
        attempt += 1;
        tokio::time::sleep(Duration::from_millis(
            (attempt as u64).pow(2) * 100,
        ))
        .await;
        if cancel.is_cancelled() {
            break;
        }
        last = check_once(candidate, config, cancel).await;
    }
    last
}

async fn check_once(
    candidate: &Candidate,
    config: &CheckerConfig,
    cancel: &CancellationToken,
) -> CheckResult {
    let start = std::time::Instant::now();
    let outcome = match candidate.protocol {
        Protocol::Http => {
            check_http(candidate, config, cancel).await
        }
        Protocol::Socks5 => check_socks5(candidate, config, cancel).await,
        Protocol::Socks4 => check_socks4(candidate, config, cancel).await,
    };
    match outcome {
        Ok(()) => CheckResult::alive(
            candidate.address.clone(),
            candidate.protocol,
            start.elapsed().as_millis() as u64,
        ),
        Err(e) => CheckResult::dead(candidate.address.clone(), candidate.protocol, e),
    }
}

async fn check_http(
    candidate: &Candidate,
    config: &CheckerConfig,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let proxy_url = format!("http://{}", candidate.address);
    let proxy = reqwest::Proxy::all(&proxy_url).map_err(|e| e.to_string())?;
    let client = http_client_builder(config)
        .proxy(proxy)
        .build()
        .map_err(|e| e.to_string())?;

    let request = client.get(&config.test_url).send();
    let response = tokio::select! {
        res = tokio::time::timeout(Duration::from_millis(config.timeout_ms), request) => {
            res.map_err(|_| "timed out".to_string())?.map_err(|e| e.to_string())?
        }
        _ = cancel.cancelled() => return Err("cancelled".to_string()),
    };

    let status = response.status().as_u16();
    if (200..400).contains(&status) {
        Ok(())
    } else {
        Err(format!("unexpected status {status}"))
    }
}

async fn check_socks5(
    candidate: &Candidate,
    config: &CheckerConfig,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let deadline = Duration::from_millis(config.socks_timeout_ms);
    let target = &config.socks_test_url;
    let proxy_addr = candidate.address.clone();
    let target = target.clone();

    let connect = Socks5Stream::connect(proxy_addr.as_str(), target.as_str());
    let mut stream = tokio::select! {
        res = tokio::time::timeout(deadline, connect) => {
            res.map_err(|_| "timed out".to_string())?.map_err(|e| e.to_string())?
        }
        _ = cancel.cancelled() => return Err("cancelled".to_string()),
    };

    if config.mode == CheckerMode::FullHttp {
        probe_http_over_stream(&mut stream, deadline).await?;
    }
    Ok(())
}

async fn check_socks4(
    candidate: &Candidate,
    config: &CheckerConfig,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let deadline = Duration::from_millis(config.socks_timeout_ms);
    let target = config.socks_test_url.clone();
    let proxy_addr = candidate.address.clone();

    let connect = Socks4Stream::connect(proxy_addr.as_str(), target.as_str());
    let mut stream = tokio::select! {
        res = tokio::time::timeout(deadline, connect) => {
            res.map_err(|_| "timed out".to_string())?.map_err(|e| e.to_string())?
        }
        _ = cancel.cancelled() => return Err("cancelled".to_string()),
    };

    if config.mode == CheckerMode::FullHttp {
        probe_http_over_stream(&mut stream, deadline).await?;
    }
    Ok(())
}

/// The "fuller variant" from §4.5's design note: issues an HTTP GET through
/// the already-established tunnel and requires a well-formed status line.
async fn probe_http_over_stream<S>(stream: &mut S, timeout: Duration) -> Result<(), String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let req = b"GET / HTTP/1.0\r\nConnection: close\r\n\r\n";
    tokio::time::timeout(timeout, stream.write_all(req))
        .await
        .map_err(|_| "timed out writing probe".to_string())?
        .map_err(|e| e.to_string())?;

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(timeout, stream.read(&mut buf))
        .await
        .map_err(|_| "timed out reading probe".to_string())?
        .map_err(|e| e.to_string())?;

    if n == 0 || !buf[..n].starts_with(b"HTTP/") {
        return Err("no valid HTTP response through tunnel".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_default_is_one_extra_attempt() {
        let cfg = CheckerConfig::default();
        assert_eq!(cfg.retries, 1);
    }

    #[test]
    fn default_mode_is_connect_only_per_open_question_resolution() {
        let cfg = CheckerConfig::default();
        assert_eq!(cfg.mode, CheckerMode::ConnectOnly);
    }

    #[tokio::test]
    async fn http_check_rejects_5xx_status() {
        // A listener that always answers 500 stands in for an HTTP proxy
        // that accepts the CONNECT/GET but returns a server error.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock
                    .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let candidate = Candidate::new(addr.to_string(), Protocol::Http);
        let config = CheckerConfig {
            timeout_ms: 2_000,
            test_url: "http://example.test/generate_204".to_string(),
            ..CheckerConfig::default()
        };
        let validator = Validator::new(config);
        let result = check_once(&candidate, &validator.config, &CancellationToken::new()).await;
        assert!(!result.alive);
    }

    #[tokio::test]
    async fn socks_enabled_false_skips_socks_candidates() {
        let config = CheckerConfig {
            socks_enabled: false,
            ..CheckerConfig::default()
        };
        let validator = Validator::new(config);
        let candidates = vec![Candidate::new("203.0.113.1:1080", Protocol::Socks5)];
        let results = validator.validate_all(candidates, CancellationToken::new()).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].alive);
        assert_eq!(results[0].error, "socks checking disabled");
    }
}
