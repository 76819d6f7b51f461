//! Server-side link validation for URLs the browser could not check (CORS).
//!
//! Requests go through a resolver that refuses private, loopback and
//! link-local addresses, so neither the initial URL nor any redirect hop can
//! reach the local network.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error};

use crate::config::VERSION;

pub const MAX_URLS: usize = 1000;
pub const DEFAULT_TIMEOUT_MS: i64 = 15_000;
pub const DEFAULT_WORKERS: i64 = 20;
const MAX_REDIRECTS: u32 = 5;
const MAX_DRAIN_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkResult {
    pub url: String,
    pub status: u16,
    /// `ok`, `redirect`, `requires_auth` or `broken`.
    pub code: &'static str,
    pub time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LinkResult {
    fn broken(url: &str, elapsed: Duration, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            status: 0,
            code: "broken",
            time_ms: elapsed.as_millis() as u64,
            redirect_to: None,
            error: Some(error.into()),
        }
    }
}

pub fn classify(status: u16) -> &'static str {
    match status {
        200..=299 => "ok",
        300..=399 => "redirect",
        401 | 403 => "requires_auth",
        _ => "broken",
    }
}

pub fn is_http_url(raw: &str) -> bool {
    raw.starts_with("http://") || raw.starts_with("https://")
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // carrier-grade NAT, 100.64.0.0/10
                || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// DNS resolution that drops every blocked address.
fn public_only_resolver(netloc: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = netloc.to_socket_addrs()?.collect();
    let allowed: Vec<SocketAddr> = addrs
        .iter()
        .copied()
        .filter(|addr| !is_blocked_ip(addr.ip()))
        .collect();
    if allowed.is_empty() && !addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("blocked request to private or local address {netloc}"),
        ));
    }
    Ok(allowed)
}

pub fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(timeout)
        .redirects(MAX_REDIRECTS)
        .user_agent(&format!("Gasoline/{VERSION}"))
        .resolver(public_only_resolver)
        .build()
}

fn call(request: ureq::Request) -> Result<ureq::Response, String> {
    match request.call() {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(_, resp)) => Ok(resp),
        Err(ureq::Error::Transport(err)) => Err(err.to_string()),
    }
}

/// HEAD first; GET when HEAD fails outright or answers 405.
pub fn check_one(agent: &ureq::Agent, url: &str) -> LinkResult {
    let started = Instant::now();
    let response = match call(agent.head(url)) {
        Ok(resp) if resp.status() != 405 => Ok(resp),
        _ => call(agent.get(url)),
    };
    let resp = match response {
        Ok(resp) => resp,
        Err(e) => return LinkResult::broken(url, started.elapsed(), e),
    };

    let status = resp.status();
    let final_url = resp.get_url().to_string();
    let location = resp.header("location").map(str::to_string);
    let redirect_to = location.or_else(|| (final_url != url).then_some(final_url));
    let drained = io::copy(&mut resp.into_reader().take(MAX_DRAIN_BYTES), &mut io::sink());
    let elapsed = started.elapsed();
    if let Err(e) = drained {
        return LinkResult {
            redirect_to,
            status,
            ..LinkResult::broken(url, elapsed, format!("failed to read response body: {e}"))
        };
    }
    LinkResult {
        url: url.to_string(),
        status,
        code: classify(status),
        time_ms: elapsed.as_millis() as u64,
        redirect_to,
        error: None,
    }
}

/// Checks every URL on a pool of `min(max_workers, urls.len())` blocking
/// workers. Results come back in input order.
pub async fn validate(urls: Vec<String>, timeout: Duration, max_workers: usize) -> Vec<LinkResult> {
    if urls.is_empty() {
        return Vec::new();
    }
    let workers = max_workers.clamp(1, urls.len());
    let agent = agent(timeout);
    let urls = Arc::new(urls);
    let jobs = Arc::new(Mutex::new((0..urls.len()).collect::<VecDeque<usize>>()));
    let results: Arc<Mutex<Vec<Option<LinkResult>>>> = Arc::new(Mutex::new(vec![None; urls.len()]));

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let agent = agent.clone();
            let urls = Arc::clone(&urls);
            let jobs = Arc::clone(&jobs);
            let results = Arc::clone(&results);
            tokio::task::spawn_blocking(move || {
                loop {
                    let Some(index) = jobs.lock().pop_front() else {
                        break;
                    };
                    let result = check_one(&agent, &urls[index]);
                    debug!(url = %result.url, code = result.code, status = result.status, "link checked");
                    results.lock()[index] = Some(result);
                }
            })
        })
        .collect();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "link validation worker failed");
        }
    }

    let mut results = results.lock();
    results
        .iter_mut()
        .zip(urls.iter())
        .map(|(slot, url)| {
            slot.take()
                .unwrap_or_else(|| LinkResult::broken(url, Duration::ZERO, "link check did not complete"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(classify(204), "ok");
        assert_eq!(classify(301), "redirect");
        assert_eq!(classify(401), "requires_auth");
        assert_eq!(classify(403), "requires_auth");
        assert_eq!(classify(404), "broken");
        assert_eq!(classify(503), "broken");
    }

    #[test]
    fn private_ranges_are_blocked() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "0.0.0.0",
            "100.64.0.1",
            "::1",
            "fd00::1",
            "fe80::1",
            "::ffff:127.0.0.1",
        ] {
            let parsed: IpAddr = ip.parse().expect("ip");
            assert!(is_blocked_ip(parsed), "{ip} should be blocked");
        }
        for ip in ["93.184.216.34", "1.1.1.1", "2606:4700:4700::1111"] {
            let parsed: IpAddr = ip.parse().expect("ip");
            assert!(!is_blocked_ip(parsed), "{ip} should be allowed");
        }
    }

    #[test]
    fn resolver_refuses_loopback() {
        let err = public_only_resolver("127.0.0.1:22").expect_err("blocked");
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn loopback_url_is_broken_with_error() {
        let results = validate(
            vec!["http://127.0.0.1:22".to_string()],
            Duration::from_secs(2),
            20,
        )
        .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].code, "broken");
        assert_eq!(results[0].status, 0);
        assert!(results[0].error.as_deref().is_some_and(|e| !e.is_empty()));
    }
}
