//! Webhook Dispatcher: fire-and-forget delivery of a job's terminal state to
//! a caller-supplied URL, with SSRF validation and full-jitter backoff.

use std::net::IpAddr;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 8;
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Clone)]
pub struct WebhookPayload {
    pub job_id: Uuid,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookUrlError {
    #[error("callback_url scheme must be http or https")]
    InvalidScheme,
    #[error("callback_url is missing a host")]
    MissingHost,
    #[error("callback_url could not be parsed: {0}")]
    Unparseable(String),
    #[error("callback_url host did not resolve to any address")]
    NoResolvedAddress,
    #[error("callback_url resolves to a reserved address")]
    ReservedAddress,
}

/// Validate scheme and host per the URL validation contract: every resolved
/// address of the host must be public. This is defense in depth; connection
/// time re-validation guards against DNS rebinding but is not implemented
/// here (documented limitation of the synchronous check).
pub async fn validate_url(raw: &str) -> Result<(), WebhookUrlError> {
    let parsed = url::Url::parse(raw).map_err(|e| WebhookUrlError::Unparseable(e.to_string()))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(WebhookUrlError::InvalidScheme);
    }

    let host = parsed.host_str().ok_or(WebhookUrlError::MissingHost)?;
    let port = parsed
        .port_or_known_default()
        .ok_or(WebhookUrlError::MissingHost)?;

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| WebhookUrlError::NoResolvedAddress)?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(WebhookUrlError::NoResolvedAddress);
    }

    if addrs.iter().any(|addr| !is_public_address(addr.ip())) {
        return Err(WebhookUrlError::ReservedAddress);
    }

    Ok(())
}

fn is_public_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || v6.is_unicast_link_local()
                || is_unique_local_v6(&v6))
        }
    }
}

/// `fc00::/7`, stable-std has no helper for this range.
fn is_unique_local_v6(addr: &std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// Draw a full-jitter backoff for the given zero-indexed attempt number.
fn jitter_backoff(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let cap = exp.min(MAX_BACKOFF);
    let millis = cap.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Validate `url`, then spawn a detached delivery task and return
    /// immediately. `shutdown` should be detached from the job's own
    /// cancellation so delivery survives a user cancel but stops on process
    /// shutdown.
    pub async fn send(
        &self,
        shutdown: CancellationToken,
        url: String,
        payload: WebhookPayload,
    ) -> Result<(), WebhookUrlError> {
        validate_url(&url).await?;

        let client = self.client.clone();
        tokio::spawn(async move {
            deliver_with_retry(client, shutdown, url, payload).await;
        });

        Ok(())
    }
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver_with_retry(
    client: reqwest::Client,
    shutdown: CancellationToken,
    url: String,
    payload: WebhookPayload,
) {
    for attempt in 0..MAX_ATTEMPTS {
        if shutdown.is_cancelled() {
            tracing::info!(url = %url, "webhook dispatch abandoned on shutdown");
            return;
        }

        let attempt_result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = tokio::time::timeout(
                PER_ATTEMPT_TIMEOUT,
                client.post(&url).json(&payload).send(),
            ) => result,
        };

        match attempt_result {
            Ok(Ok(response)) if response.status().is_success() => {
                return;
            }
            Ok(Ok(response)) => {
                tracing::warn!(
                    url = %url,
                    status = %response.status(),
                    attempt,
                    "webhook delivery attempt failed"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(url = %url, error = %e, attempt, "webhook delivery attempt errored");
            }
            Err(_) => {
                tracing::warn!(url = %url, attempt, "webhook delivery attempt timed out");
            }
        }

        if attempt + 1 < MAX_ATTEMPTS {
            let backoff = jitter_backoff(attempt);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    tracing::error!(url = %url, "webhook delivery exhausted retries, dropping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn public_ipv4_address_is_public() {
        assert!(is_public_address(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
    }

    #[test]
    fn loopback_link_local_private_and_unspecified_are_rejected() {
        assert!(!is_public_address(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(!is_public_address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!is_public_address(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(!is_public_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!is_public_address(IpAddr::V4(Ipv4Addr::new(169, 254, 1, 1))));
        assert!(!is_public_address(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))));
        assert!(!is_public_address(IpAddr::V4(Ipv4Addr::new(224, 0, 0, 1))));
    }

    #[test]
    fn ipv6_reserved_ranges_are_rejected() {
        assert!(!is_public_address("::1".parse().unwrap()));
        assert!(!is_public_address("fe80::1".parse().unwrap()));
        assert!(!is_public_address("fc00::1".parse().unwrap()));
        assert!(!is_public_address("::".parse().unwrap()));
    }

    #[tokio::test]
    async fn validate_url_rejects_non_http_scheme() {
        let err = validate_url("ftp://example.com/hook").await.unwrap_err();
        assert!(matches!(err, WebhookUrlError::InvalidScheme));
    }

    #[tokio::test]
    async fn validate_url_rejects_loopback_host() {
        let err = validate_url("http://127.0.0.1/hook").await.unwrap_err();
        assert!(matches!(err, WebhookUrlError::ReservedAddress));
    }

    #[tokio::test]
    async fn validate_url_rejects_private_literal_host() {
        let err = validate_url("http://192.168.1.5:8080/hook")
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookUrlError::ReservedAddress));
    }

    #[test]
    fn jitter_backoff_never_exceeds_the_cap() {
        for attempt in 0..20 {
            assert!(jitter_backoff(attempt) <= MAX_BACKOFF);
        }
    }

    #[test]
    fn jitter_backoff_grows_with_attempt_number_before_the_cap() {
        // Bound check: the upper bound for attempt 0 is strictly less than for attempt 3.
        let small_attempt_bound = BASE_BACKOFF.saturating_mul(1 << 0).min(MAX_BACKOFF);
        let later_attempt_bound = BASE_BACKOFF.saturating_mul(1 << 3).min(MAX_BACKOFF);
        assert!(small_attempt_bound < later_attempt_bound);
    }
}
