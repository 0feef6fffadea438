use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use super::{ProbeError, Target, connect};
use crate::monitoring::types::Outcome;

/// Software name sent back in our identification line
pub const SSH_CLIENT_SIGNATURE: &str = "ServiceMon_1.0";

/// Identification lines are at most 255 bytes including CR LF (RFC 4253)
const MAX_LINE: u64 = 255;

/// Servers may send other lines before the identification line
const MAX_PRELUDE_LINES: usize = 16;

/// Split `SSH-<protocol>-<software>` into protocol and software.
pub fn parse_identification(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, '-');
    if parts.next()? != "SSH" {
        return None;
    }
    let protocol = parts.next().filter(|p| !p.is_empty())?;
    let software = parts.next().filter(|s| !s.is_empty())?;
    Some((protocol, software))
}

pub(super) async fn execute(target: &Target) -> Result<Outcome, ProbeError> {
    let stream = connect(target).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut identification = None;
    for _ in 0..MAX_PRELUDE_LINES {
        let mut raw = Vec::new();
        let read = (&mut reader).take(MAX_LINE).read_until(b'\n', &mut raw).await?;
        if read == 0 {
            return Err(ProbeError::Closed);
        }
        let line = String::from_utf8_lossy(&raw);
        if line.starts_with("SSH-") {
            identification = Some(line.trim().to_string());
            break;
        }
    }
    let version = identification
        .ok_or_else(|| ProbeError::Protocol("no SSH identification line received".into()))?;

    let (protocol, _) = parse_identification(&version).ok_or_else(|| {
        ProbeError::Protocol(format!("malformed SSH identification from {target}: {version}"))
    })?;

    let reply = format!("SSH-{protocol}-{SSH_CLIENT_SIGNATURE}\r\n");
    writer.write_all(reply.as_bytes()).await.map_err(|e| {
        ProbeError::Protocol(format!("failed to send version reply to {target}: {e}"))
    })?;
    // Best effort; the server may already have hung up.
    let _ = writer.shutdown().await;

    Ok(Outcome::up(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::Status;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_identification() {
        assert_eq!(parse_identification("SSH-2.0-OpenSSH_7.4\r\n"), Some(("2.0", "OpenSSH_7.4")));
        assert_eq!(
            parse_identification("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3"),
            Some(("2.0", "OpenSSH_8.9p1 Ubuntu-3"))
        );
        assert_eq!(parse_identification("SSH-2.0-"), None);
        assert_eq!(parse_identification("HTTP/1.1 400 Bad Request"), None);
    }

    #[tokio::test]
    async fn test_openssh_peer_is_up_with_version() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            writer.write_all(b"SSH-2.0-OpenSSH_7.4\r\n").await.unwrap();
            let mut reply = String::new();
            BufReader::new(reader).read_line(&mut reply).await.unwrap();
            reply
        });

        let outcome = execute(&Target::new("127.0.0.1", port)).await.unwrap();
        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.diagnostic, "SSH-2.0-OpenSSH_7.4");

        let reply = server.await.unwrap();
        assert_eq!(reply, format!("SSH-2.0-{SSH_CLIENT_SIGNATURE}\r\n"));
    }

    #[tokio::test]
    async fn test_non_utf8_software_version_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SSH-2.0-Serveur\xe9_1.2\r\n").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let outcome = execute(&Target::new("127.0.0.1", port)).await.unwrap();
        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.diagnostic, "SSH-2.0-Serveur\u{fffd}_1.2");
    }

    #[tokio::test]
    async fn test_non_ssh_peer_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 ftp ready\r\n").await.unwrap();
        });

        let result = execute(&Target::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(ProbeError::Closed)));
    }
}
