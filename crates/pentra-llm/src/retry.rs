use std::future::Future;
use std::time::Duration;

use crate::error::BackendError;
use crate::provider::StatusTx;

const BASE_BACKOFF_SECS: u64 = 1;
pub(crate) const MAX_RETRIES: u32 = 3;

/// Parse the `Retry-After` header value as seconds, falling back to exponential backoff.
pub(crate) fn retry_delay(response: &reqwest::Response, attempt: u32) -> Duration {
    if let Some(val) = response.headers().get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Duration::from_secs(secs);
    }
    Duration::from_secs(BASE_BACKOFF_SECS << attempt.min(16))
}

/// Send an HTTP request, retrying up to `max_retries` times on 429 responses.
///
/// `f` must return a `reqwest::Response`. On each rate-limited attempt, emits a status
/// message and waits before retrying. Non-success statuses other than 429 are mapped
/// by [`ensure_success`].
///
/// # Errors
///
/// Returns `BackendError::RateLimited` if all attempts are exhausted,
/// `BackendError::Unavailable` for auth, server, and connection failures.
pub(crate) async fn send_with_retry<F, Fut>(
    backend_name: &str,
    max_retries: u32,
    status_tx: Option<&StatusTx>,
    mut f: F,
) -> Result<reqwest::Response, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    for attempt in 0..=max_retries {
        let response = f().await.map_err(BackendError::from)?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if attempt == max_retries {
                return Err(BackendError::RateLimited);
            }
            let delay = retry_delay(&response, attempt);
            let msg = format!(
                "{backend_name} rate limited, retrying in {}s ({}/{})",
                delay.as_secs(),
                attempt + 1,
                max_retries
            );
            if let Some(tx) = status_tx {
                let _ = tx.send(msg.clone());
            }
            tracing::warn!("{msg}");
            tokio::time::sleep(delay).await;
            continue;
        }

        return ensure_success(backend_name, response).await;
    }

    Err(BackendError::RateLimited)
}

/// Map a non-success response to the matching error.
///
/// # Errors
///
/// 401/403 and 5xx become `Unavailable`; any other failure status becomes `Other`.
pub(crate) async fn ensure_success(
    backend_name: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::error!("{backend_name} API error {status}: {body}");

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(BackendError::Unavailable(format!(
            "{backend_name} rejected the credentials (status {status})"
        )));
    }
    if status.is_server_error() {
        return Err(BackendError::Unavailable(format!(
            "{backend_name} server error (status {status})"
        )));
    }
    Err(BackendError::Other(format!(
        "{backend_name} API request failed (status {status})"
    )))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn retry_delay_exponential_backoff() {
        assert_eq!(BASE_BACKOFF_SECS << 0, 1);
        assert_eq!(BASE_BACKOFF_SECS << 1, 2);
        assert_eq!(BASE_BACKOFF_SECS << 2, 4);
    }

    /// Spawn a minimal HTTP server that returns a fixed response for each connection.
    /// Returns (port, join_handle).
    pub(crate) async fn spawn_mock_server(
        responses: Vec<&'static str>,
    ) -> (u16, tokio::task::JoinHandle<()>) {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            for resp in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.split();
                    let mut buf_reader = BufReader::new(reader);
                    let mut content_length = 0usize;
                    let mut line = String::new();
                    loop {
                        line.clear();
                        buf_reader.read_line(&mut line).await.unwrap_or(0);
                        if line == "\r\n" || line == "\n" || line.is_empty() {
                            break;
                        }
                        if let Some((name, value)) = line.split_once(':')
                            && name.eq_ignore_ascii_case("content-length")
                        {
                            content_length = value.trim().parse().unwrap_or(0);
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    buf_reader.read_exact(&mut body).await.ok();
                    writer.write_all(resp.as_bytes()).await.ok();
                    writer.shutdown().await.ok();
                });
            }
        });

        (port, handle)
    }

    async fn get_with_retry(
        port: u16,
        max_retries: u32,
        status_tx: Option<&StatusTx>,
    ) -> Result<reqwest::Response, BackendError> {
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{port}/test");
        send_with_retry("test", max_retries, status_tx, || {
            let req = client.get(&url).build().unwrap();
            let c = client.clone();
            async move { c.execute(req).await }
        })
        .await
    }

    const RATE_LIMITED: &str =
        "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 0\r\nContent-Length: 0\r\n\r\n";
    const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

    #[tokio::test]
    async fn send_with_retry_success_on_first_attempt() {
        let (port, _handle) = spawn_mock_server(vec![OK]).await;
        let result = get_with_retry(port, 3, None).await;
        assert!(result.is_ok(), "expected Ok, got: {result:?}");
        assert_eq!(result.unwrap().status(), 200);
    }

    #[tokio::test]
    async fn send_with_retry_exhausts_retries_returns_rate_limited() {
        let (port, _handle) = spawn_mock_server(vec![RATE_LIMITED, RATE_LIMITED]).await;

        // max_retries=1 means: attempt 0 (429 → retry), attempt 1 (429 → fail)
        let result = get_with_retry(port, 1, None).await;
        assert!(
            matches!(result, Err(BackendError::RateLimited)),
            "expected RateLimited, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn send_with_retry_succeeds_after_one_429_and_reports_status() {
        let (port, _handle) = spawn_mock_server(vec![RATE_LIMITED, OK]).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let result = get_with_retry(port, 2, Some(&tx)).await;
        assert!(result.is_ok(), "expected Ok after one retry, got: {result:?}");

        let status = rx.try_recv().unwrap();
        assert!(status.contains("test rate limited"), "{status}");
        assert!(status.contains("(1/2)"), "{status}");
    }

    #[tokio::test]
    async fn unauthorized_maps_to_unavailable() {
        let (port, _handle) = spawn_mock_server(vec![
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 3\r\n\r\nbad",
        ])
        .await;
        let result = get_with_retry(port, 3, None).await;
        assert!(
            matches!(result, Err(BackendError::Unavailable(ref m)) if m.contains("credentials")),
            "got: {result:?}"
        );
    }

    #[tokio::test]
    async fn server_error_maps_to_unavailable() {
        let (port, _handle) = spawn_mock_server(vec![
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        ])
        .await;
        let result = get_with_retry(port, 3, None).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    async fn bad_request_maps_to_other() {
        let (port, _handle) =
            spawn_mock_server(vec!["HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n"]).await;
        let result = get_with_retry(port, 3, None).await;
        assert!(matches!(result, Err(BackendError::Other(_))));
    }

    #[tokio::test]
    async fn connection_refused_maps_to_unavailable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = get_with_retry(port, 3, None).await;
        assert!(
            matches!(result, Err(BackendError::Unavailable(_))),
            "got: {result:?}"
        );
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn retry_delay_range_always_valid(attempt in 0u32..16) {
            let delay = Duration::from_secs(BASE_BACKOFF_SECS << attempt);
            assert!(delay.as_secs() >= BASE_BACKOFF_SECS, "delay must be at least base backoff");
            if attempt > 0 {
                let prev = Duration::from_secs(BASE_BACKOFF_SECS << (attempt - 1));
                assert_eq!(delay.as_secs(), prev.as_secs() * 2);
            }
        }
    }
}
