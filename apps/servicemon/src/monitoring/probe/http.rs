use std::time::Duration;

use reqwest::header::SERVER;
use url::Url;

use super::{ProbeError, Target};
use crate::monitoring::types::Outcome;

/// Build the URL a probe fetches.
pub(super) fn probe_url(target: &Target, path: &str, tls: bool) -> Result<Url, ProbeError> {
    let scheme = if tls { "https" } else { "http" };
    let mut url = Url::parse(&format!("{scheme}://{target}"))
        .map_err(|e| ProbeError::Protocol(format!("invalid URL for {target}: {e}")))?;

    // Paths may carry a query string
    match path.split_once('?') {
        Some((path, query)) => {
            url.set_path(path);
            url.set_query(Some(query));
        }
        None => url.set_path(path),
    }
    Ok(url)
}

/// GET the configured path; up carries the `Server` header.
pub(super) async fn execute(
    target: &Target,
    path: &str,
    tls: bool,
    limit: Duration,
) -> Result<Outcome, ProbeError> {
    let url = probe_url(target, path, tls)?;
    let client = reqwest::Client::builder()
        .timeout(limit)
        .user_agent(concat!("servicemon/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let response = client.get(url).send().await?;
    let server = response
        .headers()
        .get(SERVER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "OK".to_string());

    Ok(Outcome::up(server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::Status;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_probe_url() {
        let url = probe_url(&Target::new("www.example.org", 8080), "/status?full=1", false).unwrap();
        assert_eq!(url.as_str(), "http://www.example.org:8080/status?full=1");

        let url = probe_url(&Target::new("::1", 443), "/", true).unwrap();
        assert_eq!(url.as_str(), "https://[::1]/");
    }

    #[tokio::test]
    async fn test_server_header_is_diagnostic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nServer: Apache/2.4.57\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                )
                .await
                .unwrap();
        });

        let outcome = execute(&Target::new("127.0.0.1", port), "/", false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.diagnostic, "Apache/2.4.57");
    }
}
