use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::{Credentials, ProbeError, Target, connect};
use crate::monitoring::types::Outcome;

/// Word that starts the trailing comment of some greetings
const COMMENT_MARKER: &str = "at";

/// Extract the server version from an untagged greeting.
///
/// The leading `*` and status tokens are dropped, the rest is kept up to the
/// comment marker. Returns `None` unless the greeting is `OK` or `PREAUTH`.
pub fn parse_greeting(greeting: &str) -> Option<String> {
    let mut tokens = greeting.trim().split(' ').filter(|t| !t.is_empty());
    if tokens.next()? != "*" {
        return None;
    }
    let status = tokens.next()?;
    if !status.eq_ignore_ascii_case("OK") && !status.eq_ignore_ascii_case("PREAUTH") {
        return None;
    }
    let version: Vec<&str> = tokens.take_while(|t| *t != COMMENT_MARKER).collect();
    Some(version.join(" "))
}

/// Quote a string for use as an IMAP quoted argument
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Session {
    /// Next line, decoded leniently since greetings are not always UTF-8
    async fn read_line(&mut self) -> Result<Option<String>, ProbeError> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&line).trim_end().to_string()))
    }

    /// Send a tagged command and return the text of its tagged completion.
    async fn command(&mut self, tag: &str, command: &str) -> Result<Option<String>, ProbeError> {
        self.writer.write_all(format!("{tag} {command}\r\n").as_bytes()).await?;
        let prefix = format!("{tag} ");
        while let Some(line) = self.read_line().await? {
            if let Some(rest) = line.strip_prefix(&prefix) {
                return Ok(Some(rest.to_string()));
            }
        }
        Ok(None)
    }
}

pub(super) async fn execute(
    target: &Target,
    credentials: Option<&Credentials>,
) -> Result<Outcome, ProbeError> {
    let (reader, writer) = connect(target).await?.into_split();
    let mut session = Session { reader: BufReader::new(reader), writer };

    let greeting = session.read_line().await?.ok_or(ProbeError::Closed)?;
    let version = parse_greeting(&greeting)
        .ok_or_else(|| ProbeError::Protocol(format!("unexpected IMAP greeting: {greeting}")))?;

    if let Some(credentials) = credentials {
        let login = format!("LOGIN {} {}", quote(&credentials.username), quote(&credentials.password));
        match session.command("a001", &login).await? {
            Some(reply) if reply.split(' ').next().is_some_and(|s| s.eq_ignore_ascii_case("OK")) => {}
            Some(reply) => return Err(ProbeError::Protocol(format!("IMAP login rejected: {reply}"))),
            None => return Err(ProbeError::Closed),
        }
        // Servers may hang up right after the BYE, so a missing completion is fine.
        session.command("a002", "LOGOUT").await?;
    }

    Ok(Outcome::up(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::Status;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_dovecot_greeting() {
        assert_eq!(
            parse_greeting("* OK [CAPABILITY IMAP4rev1] Dovecot ready.").as_deref(),
            Some("[CAPABILITY IMAP4rev1] Dovecot ready.")
        );
    }

    #[test]
    fn test_parse_greeting_stops_at_comment_marker() {
        assert_eq!(
            parse_greeting("* OK mail.example.org Cyrus IMAP4 v2.1.11 server ready at Mon Jun 16\r\n")
                .as_deref(),
            Some("mail.example.org Cyrus IMAP4 v2.1.11 server ready")
        );
    }

    #[test]
    fn test_parse_greeting_rejects_bye() {
        assert_eq!(parse_greeting("* BYE too many connections"), None);
        assert_eq!(parse_greeting("garbage"), None);
        assert_eq!(parse_greeting("* PREAUTH").as_deref(), Some(""));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    /// Minimal IMAP server accepting one login
    async fn serve(listener: TcpListener, accept_login: bool) -> Vec<String> {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);
        writer.write_all(b"* OK [CAPABILITY IMAP4rev1] Dovecot ready.\r\n").await.unwrap();

        let mut seen = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            let tag = line.split(' ').next().unwrap().to_string();
            seen.push(line.clone());
            if line.contains("LOGIN") {
                let reply = if accept_login { "OK Logged in" } else { "NO [AUTHENTICATIONFAILED] nope" };
                writer.write_all(format!("{tag} {reply}\r\n").as_bytes()).await.unwrap();
                if !accept_login {
                    break;
                }
            } else if line.contains("LOGOUT") {
                writer.write_all(b"* BYE Logging out\r\n").await.unwrap();
                writer.write_all(format!("{tag} OK Logout completed\r\n").as_bytes()).await.unwrap();
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_login_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve(listener, true));

        let creds = Credentials { username: "nav".into(), password: "secret".into() };
        let outcome = execute(&Target::new("127.0.0.1", port), Some(&creds)).await.unwrap();
        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.diagnostic, "[CAPABILITY IMAP4rev1] Dovecot ready.");

        let seen = server.await.unwrap();
        assert_eq!(seen, vec![r#"a001 LOGIN "nav" "secret""#.to_string(), "a002 LOGOUT".to_string()]);
    }

    #[tokio::test]
    async fn test_latin1_greeting_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"* OK Serveur IMAP pr\xeat\r\n").await.unwrap();
        });

        let outcome = execute(&Target::new("127.0.0.1", port), None).await.unwrap();
        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.diagnostic, "Serveur IMAP pr\u{fffd}t");
    }

    #[tokio::test]
    async fn test_rejected_login_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, false));

        let creds = Credentials { username: "nav".into(), password: "wrong".into() };
        let result = execute(&Target::new("127.0.0.1", port), Some(&creds)).await;
        assert!(matches!(result, Err(ProbeError::Protocol(msg)) if msg.contains("login rejected")));
    }
}
