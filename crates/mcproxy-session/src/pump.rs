//! The packet pump: the two-socket splice that drives one proxied
//! connection end to end (spec.md §4, §4.6, §4.7). Reads frames off
//! whichever socket has data, decrypts/decompresses them, routes them
//! through the handshake state machine while `session.phase < Play`,
//! re-encrypts/re-compresses, and writes them to the other socket.

use crate::handshake;
use crate::session::Session;
use mcproxy_common::error::{ProxyError, Result};
use mcproxy_common::framing::{
    decode_frame, encode_frame_compressed, encode_frame_never_compressed, encode_frame_plain,
};
use mcproxy_common::packet::{Direction, Phase};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Drives `session` until either socket closes, a fatal protocol error
/// occurs, or `shutdown` fires. `client` is the real client's socket;
/// `upstream` is the real server's socket; `hijack_rx` resolves once the
/// session-hijack endpoint has captured the client's launcher identifiers.
pub async fn run(
    mut session: Session,
    mut client: TcpStream,
    mut upstream: TcpStream,
    hijack_rx: oneshot::Receiver<mcproxy_common::Result<mcproxy_hijack::HijackedIdentifiers>>,
    session_host: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut hijack_rx = Some(hijack_rx);

    let mut client_in = Vec::new();
    let mut upstream_in = Vec::new();
    let mut read_buf = vec![0u8; READ_CHUNK];

    loop {
        if *shutdown.borrow() {
            info!("session pump shutting down");
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                continue;
            }

            result = client.read(&mut read_buf) => {
                match result {
                    Ok(0) => { debug!("client closed its half of the connection"); break; }
                    Ok(n) => client_in.extend_from_slice(&read_buf[..n]),
                    Err(e) => { warn!("client read failed: {e}"); break; }
                }
                if let Err(e) = drain_client_to_server(
                    &mut session,
                    &mut client_in,
                    &mut client,
                    &mut upstream,
                    &mut hijack_rx,
                    &session_host,
                ).await {
                    if e.is_fatal() {
                        warn!("client->server frame handling failed: {e}");
                        break;
                    }
                    warn!("non-fatal client->server error: {e}");
                }
            }

            result = upstream.read(&mut read_buf) => {
                match result {
                    Ok(0) => { debug!("upstream closed its half of the connection"); break; }
                    Ok(n) => upstream_in.extend_from_slice(&read_buf[..n]),
                    Err(e) => { warn!("upstream read failed: {e}"); break; }
                }
                if let Err(e) = drain_server_to_client(
                    &mut session,
                    &mut upstream_in,
                    &mut upstream,
                    &mut client,
                ).await {
                    if e.is_fatal() {
                        warn!("server->client frame handling failed: {e}");
                        break;
                    }
                    warn!("non-fatal server->client error: {e}");
                }
            }
        }
    }
}

/// Extracts every complete frame currently buffered in `buf`, decrypting
/// with the client-facing cipher, routing PLAY-phase frames through the
/// packet registry (and everything else through the handshake state
/// machine), re-encrypting/forwarding to `upstream`, then flushing any
/// retour frames queued back toward `client` this iteration.
async fn drain_client_to_server(
    session: &mut Session,
    buf: &mut Vec<u8>,
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    hijack_rx: &mut Option<oneshot::Receiver<mcproxy_common::Result<mcproxy_hijack::HijackedIdentifiers>>>,
    session_host: &str,
) -> Result<()> {
    session.client_cipher.decrypt(buf);

    loop {
        let Some(body) = decode_frame(buf, session.compression_enabled())? else {
            break;
        };
        if let Some(trace) = session.trace.as_mut() {
            trace.write_frame(Direction::ClientToServer, &body)?;
        }

        let (outgoing, never_compress) = if session.phase == Phase::Play {
            let packet = session.registry.decode(Direction::ClientToServer, Phase::Play, &body)?;
            (packet.to_bytes()?, false)
        } else {
            let rx = hijack_rx
                .take()
                .ok_or_else(|| ProxyError::handshake("session-hijack receiver already consumed"))?;
            let result =
                handshake::handle_client_to_server(session, &body, rx, session_host).await;
            (result?, true)
        };

        let framed = frame_outgoing(session, &outgoing, never_compress)?;

        let mut out = framed;
        session.server_cipher.encrypt(&mut out);
        upstream.write_all(&out).await.map_err(ProxyError::Transport)?;

        // One-tick delay: the frame that raised `enable_encryption` (the
        // rewritten EncryptionResponse) is flushed above using whatever
        // cipher state was active *before* this frame, so it always goes
        // out plaintext. Only the next frame drained from this buffer (or
        // the next pump iteration) observes the newly-active cipher.
        if session.enable_encryption {
            session.activate_encryption();
        }
    }

    flush_retour_to_client(session, client).await?;
    Ok(())
}

/// Same as [`drain_client_to_server`] but in the opposite direction.
async fn drain_server_to_client(
    session: &mut Session,
    buf: &mut Vec<u8>,
    upstream: &mut TcpStream,
    client: &mut TcpStream,
) -> Result<()> {
    session.server_cipher.decrypt(buf);

    loop {
        let Some(body) = decode_frame(buf, session.compression_enabled())? else {
            break;
        };
        if let Some(trace) = session.trace.as_mut() {
            trace.write_frame(Direction::ServerToClient, &body)?;
        }

        let (outgoing, never_compress) = if session.phase == Phase::Play {
            let packet = session.registry.decode(Direction::ServerToClient, Phase::Play, &body)?;
            (packet.to_bytes()?, false)
        } else {
            (handshake::handle_server_to_client(session, &body)?, true)
        };

        let framed = frame_outgoing(session, &outgoing, never_compress)?;

        let mut out = framed;
        session.client_cipher.encrypt(&mut out);
        client.write_all(&out).await.map_err(ProxyError::Transport)?;

        // See the matching comment in `drain_client_to_server`: activation
        // is deferred until after this frame is on the wire so the one-tick
        // delay holds regardless of which direction observes it first.
        if session.enable_encryption {
            session.activate_encryption();
        }
    }

    flush_retour_to_upstream(session, upstream).await?;
    Ok(())
}

/// Wraps `body` for the wire. Pre-PLAY frames (handshake/login packets,
/// including the two that straddle the compression toggle per spec.md
/// §4.1) are always forced through [`encode_frame_never_compressed`]
/// regardless of body size; PLAY-phase frames use the session's real
/// threshold.
fn frame_outgoing(session: &Session, body: &[u8], never_compress: bool) -> Result<Vec<u8>> {
    if never_compress {
        return encode_frame_never_compressed(body, session.compression_enabled());
    }
    if session.compression_enabled() {
        encode_frame_compressed(body, compression_threshold_as_u32(session))
    } else {
        Ok(encode_frame_plain(body))
    }
}

/// Flushes whatever retour frames were queued toward the client this
/// iteration, framing and encrypting each with `client_cipher` — the
/// inverse of the `server_cipher` context this iteration's forwarded
/// traffic went out under.
async fn flush_retour_to_client(session: &mut Session, client: &mut TcpStream) -> Result<()> {
    for body in session.take_retour_to_client() {
        let framed = frame_outgoing(session, &body, session.phase != Phase::Play)?;
        let mut out = framed;
        session.client_cipher.encrypt(&mut out);
        client.write_all(&out).await.map_err(ProxyError::Transport)?;
    }
    Ok(())
}

/// Flushes whatever retour frames were queued toward the real server this
/// iteration, framing and encrypting each with `server_cipher` — the
/// inverse of the `client_cipher` context this iteration's forwarded
/// traffic went out under.
async fn flush_retour_to_upstream(session: &mut Session, upstream: &mut TcpStream) -> Result<()> {
    for body in session.take_retour_to_upstream() {
        let framed = frame_outgoing(session, &body, session.phase != Phase::Play)?;
        let mut out = framed;
        session.server_cipher.encrypt(&mut out);
        upstream.write_all(&out).await.map_err(ProxyError::Transport)?;
    }
    Ok(())
}

fn compression_threshold_as_u32(session: &Session) -> u32 {
    session.compression_threshold.max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_compression_threshold_as_u32_clamps_negative() {
        let mut session = Session::new();
        session.compression_threshold = -1;
        assert_eq!(compression_threshold_as_u32(&session), 0);
        session.compression_threshold = 128;
        assert_eq!(compression_threshold_as_u32(&session), 128);
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (connect_result, accept_result) = tokio::join!(connect, accept);
        (connect_result.unwrap(), accept_result.unwrap().0)
    }

    #[tokio::test]
    async fn test_drain_server_to_client_forwards_play_frames_opaquely() {
        let (mut upstream_side, mut client_side) = loopback_pair().await;
        let (mut unused_upstream, _unused_upstream_peer) = loopback_pair().await;
        let mut session = Session::new();
        session.phase = Phase::Play;

        let body = vec![0x10, 0xAA, 0xBB, 0xCC];
        let mut inbound = mcproxy_common::framing::encode_frame_plain(&body);

        drain_server_to_client(&mut session, &mut inbound, &mut unused_upstream, &mut upstream_side)
            .await
            .unwrap();
        assert!(inbound.is_empty());

        let mut received = vec![0u8; 64];
        let n = client_side.read(&mut received).await.unwrap();
        let mut on_wire = received[..n].to_vec();
        let decoded = mcproxy_common::framing::decode_frame(&mut on_wire, false)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn test_drain_server_to_client_rewrites_encryption_request() {
        let (mut upstream_side, mut client_side) = loopback_pair().await;
        let (mut unused_upstream, _unused_upstream_peer) = loopback_pair().await;
        let mut session = Session::new();
        session.phase = Phase::Login;
        session.login_stage = crate::session::LoginStage::AwaitingEncryptionRequest;

        let mut rng = rand::rngs::OsRng;
        use rsa::pkcs1::EncodeRsaPublicKey;
        use rsa::{RsaPrivateKey, RsaPublicKey};
        let upstream_private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let upstream_public = RsaPublicKey::from(&upstream_private);
        let upstream_der = upstream_public.to_pkcs1_der().unwrap().as_bytes().to_vec();

        let mut request_payload = Vec::new();
        mcproxy_common::wire::write_string(&mut request_payload, "");
        mcproxy_common::wire::write_bytes(&mut request_payload, &upstream_der);
        mcproxy_common::wire::write_bytes(&mut request_payload, &[1, 2, 3, 4]);
        let mut body = Vec::new();
        mcproxy_common::framing::write_varint(&mut body, crate::handshake::ENCRYPTION_REQUEST_ID);
        body.extend_from_slice(&request_payload);

        let mut inbound = mcproxy_common::framing::encode_frame_plain(&body);
        drain_server_to_client(&mut session, &mut inbound, &mut unused_upstream, &mut upstream_side)
            .await
            .unwrap();

        assert_eq!(
            session.login_stage,
            crate::session::LoginStage::AwaitingEncryptionResponse
        );

        let mut received = Vec::new();
        let mut chunk = vec![0u8; 4096];
        let n = client_side.read(&mut chunk).await.unwrap();
        received.extend_from_slice(&chunk[..n]);
        let decoded = mcproxy_common::framing::decode_frame(&mut received, false)
            .unwrap()
            .unwrap();
        let (_, id_bytes) = mcproxy_common::framing::read_varint(&decoded).unwrap().unwrap();
        assert_ne!(&decoded[id_bytes..], &request_payload[..]);
    }

    #[derive(Debug)]
    struct Rejecting;

    impl mcproxy_common::packet::PacketBody for Rejecting {
        fn encode(&self) -> mcproxy_common::error::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn decode_rejecting(
        _payload: &[u8],
    ) -> mcproxy_common::error::Result<Box<dyn mcproxy_common::packet::PacketBody>> {
        Err(mcproxy_common::error::ProxyError::framing(
            "registered decoder deliberately rejects this packet",
        ))
    }

    #[tokio::test]
    async fn test_play_phase_frames_are_dispatched_through_the_registry() {
        // A decoder registered for this (direction, phase, id) must
        // actually run — proven by it erroring out a frame that would
        // otherwise have sailed through as an opaque passthrough.
        let (mut client_side, mut upstream_side) = loopback_pair().await;
        let mut session = Session::new();
        session.phase = Phase::Play;
        session
            .registry
            .register(Direction::ClientToServer, Phase::Play, 0x77, decode_rejecting);

        let mut body = Vec::new();
        mcproxy_common::framing::write_varint(&mut body, 0x77);
        body.extend_from_slice(b"anything");
        let mut inbound = mcproxy_common::framing::encode_frame_plain(&body);

        let mut hijack_rx = None;
        let err = drain_client_to_server(
            &mut session,
            &mut inbound,
            &mut client_side,
            &mut upstream_side,
            &mut hijack_rx,
            "play.example.com",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("deliberately rejects"));
    }

    #[tokio::test]
    async fn test_retour_frame_is_flushed_back_to_client() {
        let (mut client_side, mut client_peer) = loopback_pair().await;
        let (mut upstream_side, _upstream_peer) = loopback_pair().await;
        let mut session = Session::new();
        session.phase = Phase::Play;

        let retour_body = vec![0x20, 0x01, 0x02];
        session.queue_retour_to_client(retour_body.clone());

        // An empty buffer: no real traffic to forward this iteration, but
        // the queued retour frame must still go out to the client.
        let mut inbound = Vec::new();
        let mut hijack_rx = None;
        drain_client_to_server(
            &mut session,
            &mut inbound,
            &mut client_side,
            &mut upstream_side,
            &mut hijack_rx,
            "play.example.com",
        )
        .await
        .unwrap();

        let mut received = vec![0u8; 64];
        let n = client_peer.read(&mut received).await.unwrap();
        let mut on_wire = received[..n].to_vec();
        let decoded = mcproxy_common::framing::decode_frame(&mut on_wire, false)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, retour_body);
        assert!(session.take_retour_to_client().is_empty());
    }
}
