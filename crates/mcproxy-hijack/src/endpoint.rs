//! Local HTTP/1.1 listener that impersonates the upstream session service
//! long enough to capture the real client's access token. Accepts exactly
//! one `POST` per client login; everything else is a protocol error.

use mcproxy_common::error::ProxyError;
use mcproxy_common::Result;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// The three string fields the real launcher's session-join call carries,
/// captured so the handshake can re-sign and forward its own join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HijackedIdentifiers {
    pub access_token: String,
    pub selected_profile: String,
    pub server_id: String,
}

/// Binds `addr` and spawns a task that accepts a single `POST
/// /session/minecraft/join` request, captures its three JSON fields, and
/// replies `204 No Content`. The returned receiver resolves once that
/// request has been fully handled — the handshake awaits it at step 3
/// before it may forward `EncryptionResponse` upstream.
pub fn spawn(addr: SocketAddr) -> oneshot::Receiver<Result<HijackedIdentifiers>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = accept_one(addr).await;
        if let Err(ref e) = result {
            warn!("session-hijack endpoint failed: {e}");
        }
        let _ = tx.send(result);
    });
    rx
}

async fn accept_one(addr: SocketAddr) -> Result<HijackedIdentifiers> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(ProxyError::Transport)?;
    info!("session-hijack endpoint listening on {addr}");

    let (stream, peer) = listener.accept().await.map_err(ProxyError::Transport)?;
    info!("session-hijack endpoint accepted connection from {peer}");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .await
        .map_err(ProxyError::Transport)?;
    if !request_line.starts_with("POST") {
        return Err(ProxyError::hijack(format!(
            "expected a POST request, got: {}",
            request_line.trim()
        )));
    }

    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(ProxyError::Transport)?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }
    let content_length =
        content_length.ok_or_else(|| ProxyError::hijack("missing Content-Length header"))?;

    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(ProxyError::Transport)?;
    let body = String::from_utf8(body)
        .map_err(|e| ProxyError::hijack(format!("request body is not UTF-8: {e}")))?;

    let access_token = scan_field(&body, "accessToken")
        .ok_or_else(|| ProxyError::hijack("missing accessToken field"))?;
    let selected_profile = scan_field(&body, "selectedProfile")
        .ok_or_else(|| ProxyError::hijack("missing selectedProfile field"))?;
    let server_id = scan_field(&body, "serverId")
        .ok_or_else(|| ProxyError::hijack("missing serverId field"))?;

    let response = build_204_response();
    write_half
        .write_all(response.as_bytes())
        .await
        .map_err(ProxyError::Transport)?;
    write_half.flush().await.map_err(ProxyError::Transport)?;

    Ok(HijackedIdentifiers {
        access_token,
        selected_profile,
        server_id,
    })
}

/// Permissive field scanner: find the key, skip to the first `"` after it,
/// capture until the next `"`. Does not attempt general JSON parsing —
/// this mirrors what the original launcher's session POST body actually
/// looks like and nothing fancier is needed.
fn scan_field(body: &str, key: &str) -> Option<String> {
    let key_pos = body.find(key)?;
    let after_key = &body[key_pos + key.len()..];
    let quote_start = after_key.find('"')? + 1;
    let rest = &after_key[quote_start..];
    let quote_end = rest.find('"')?;
    Some(rest[..quote_end].to_string())
}

fn build_204_response() -> String {
    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    format!(
        "HTTP/1.1 204 No Content\r\n\
         Date: {date}\r\n\
         Server: mcproxy\r\n\
         Connection: keep-alive\r\n\
         Content-length: 0\r\n\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[test]
    fn test_scan_field_permissive() {
        let body = r#"{"accessToken":"A","selectedProfile":"B","serverId":"C"}"#;
        assert_eq!(scan_field(body, "accessToken").as_deref(), Some("A"));
        assert_eq!(scan_field(body, "selectedProfile").as_deref(), Some("B"));
        assert_eq!(scan_field(body, "serverId").as_deref(), Some("C"));
    }

    #[test]
    fn test_scan_field_missing() {
        let body = r#"{"accessToken":"A"}"#;
        assert_eq!(scan_field(body, "serverId"), None);
    }

    #[test]
    fn test_scan_field_tolerates_whitespace_and_trailing_garbage() {
        let body = "{\"accessToken\": \"A\", \"selectedProfile\": \"B\", \"serverId\": \"C\"}   \n\n";
        assert_eq!(scan_field(body, "accessToken").as_deref(), Some("A"));
        assert_eq!(scan_field(body, "serverId").as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn test_accept_one_parses_post_and_replies_204() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = tokio::spawn(accept_one(addr));
        // Give the server a moment to bind before the client connects.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let body = r#"{"accessToken":"tok","selectedProfile":"prof","serverId":"sid"}"#;
        let request = format!(
            "POST /session/minecraft/join HTTP/1.1\r\n\
             Host: localhost\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 204 No Content"));

        let identifiers = server.await.unwrap().unwrap();
        assert_eq!(identifiers.access_token, "tok");
        assert_eq!(identifiers.selected_profile, "prof");
        assert_eq!(identifiers.server_id, "sid");
    }
}
