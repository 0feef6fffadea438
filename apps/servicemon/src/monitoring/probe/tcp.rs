use tokio::io::AsyncReadExt;

use super::{ProbeError, Target, connect};
use crate::monitoring::types::Outcome;

/// Largest banner read in one round
const BANNER_BUFFER: usize = 1024;

/// Connect and treat any successful read as up, the banner as diagnostic.
pub(super) async fn execute(target: &Target) -> Result<Outcome, ProbeError> {
    let mut stream = connect(target).await?;
    let mut buffer = [0u8; BANNER_BUFFER];
    let read = stream.read(&mut buffer).await?;
    let banner = String::from_utf8_lossy(&buffer[..read]).trim().to_string();
    Ok(Outcome::up(banner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::Status;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_banner_is_trimmed_diagnostic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 mail.example.org ESMTP ready\r\n").await.unwrap();
        });

        let outcome = execute(&Target::new("127.0.0.1", port)).await.unwrap();
        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.diagnostic, "220 mail.example.org ESMTP ready");
    }
}
