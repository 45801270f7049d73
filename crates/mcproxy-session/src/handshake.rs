//! The handshake state machine: the five-step LOGIN sequence from
//! spec.md §4.4, rewriting the two cryptographic packets in flight so the
//! proxy looks like the server to the client and like the client to the
//! server.

use crate::session::{LoginStage, Session};
use mcproxy_common::error::{ProxyError, Result};
use mcproxy_common::framing::{read_varint, write_varint};
use mcproxy_common::packet::Phase;
use mcproxy_common::wire::{read_bytes, read_string, write_bytes, write_string};
use mcproxy_hijack::{compute_server_id_hash, post_session_join, HijackedIdentifiers};
use tokio::sync::oneshot;
use tracing::{info, warn};

pub const HANDSHAKE_ID: u32 = 0x00;
pub const ENCRYPTION_REQUEST_ID: u32 = 0x01;
pub const ENCRYPTION_RESPONSE_ID: u32 = 0x01;
pub const SET_COMPRESSION_ID: u32 = 0x03;
pub const LOGIN_SUCCESS_ID: u32 = 0x02;

const NEXT_STATE_STATUS: u32 = 1;
const NEXT_STATE_LOGIN: u32 = 2;

struct Handshake {
    protocol_version: u32,
    server_address: String,
    server_port: u16,
    next_state: u32,
}

impl Handshake {
    fn decode(payload: &[u8]) -> Result<Self> {
        let (protocol_version, n1) = read_varint(payload)?
            .ok_or_else(|| ProxyError::framing("truncated handshake: protocol_version"))?;
        let (server_address, n2) = read_string(&payload[n1..])?;
        let port_start = n1 + n2;
        if payload.len() < port_start + 2 {
            return Err(ProxyError::framing("truncated handshake: server_port"));
        }
        let server_port = u16::from_be_bytes([payload[port_start], payload[port_start + 1]]);
        let (next_state, _n3) = read_varint(&payload[port_start + 2..])?
            .ok_or_else(|| ProxyError::framing("truncated handshake: next_state"))?;
        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    #[cfg(test)]
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, self.protocol_version);
        write_string(&mut out, &self.server_address);
        out.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(&mut out, self.next_state);
        out
    }
}

struct EncryptionRequest {
    server_id: String,
    public_key_der: Vec<u8>,
    verify_token: Vec<u8>,
}

impl EncryptionRequest {
    fn decode(payload: &[u8]) -> Result<Self> {
        let (server_id, n1) = read_string(payload)?;
        let (public_key_der, n2) = read_bytes(&payload[n1..])?;
        let (verify_token, _n3) = read_bytes(&payload[n1 + n2..])?;
        Ok(Self {
            server_id,
            public_key_der,
            verify_token,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_string(&mut out, &self.server_id);
        write_bytes(&mut out, &self.public_key_der);
        write_bytes(&mut out, &self.verify_token);
        out
    }
}

struct EncryptionResponse {
    shared_secret_ct: Vec<u8>,
    verify_token_ct: Vec<u8>,
}

impl EncryptionResponse {
    fn decode(payload: &[u8]) -> Result<Self> {
        let (shared_secret_ct, n1) = read_bytes(payload)?;
        let (verify_token_ct, _n2) = read_bytes(&payload[n1..])?;
        Ok(Self {
            shared_secret_ct,
            verify_token_ct,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_bytes(&mut out, &self.shared_secret_ct);
        write_bytes(&mut out, &self.verify_token_ct);
        out
    }
}

struct SetCompression {
    threshold: i32,
}

impl SetCompression {
    fn decode(payload: &[u8]) -> Result<Self> {
        let (threshold, _) = read_varint(payload)?
            .ok_or_else(|| ProxyError::framing("truncated SetCompression"))?;
        Ok(Self {
            threshold: threshold as i32,
        })
    }
}

fn frame_body(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, id);
    out.extend_from_slice(payload);
    out
}

fn peek_id(body: &[u8]) -> Result<(u32, usize)> {
    read_varint(body)?.ok_or_else(|| ProxyError::framing("frame body missing packet id"))
}

/// Handles one client-to-server frame body during the pre-PLAY phases.
/// Returns the bytes to forward to the server (possibly rewritten).
///
/// `hijack_rx` is consumed the first time `EncryptionResponse` is
/// processed: the handshake must await the real launcher's session-join
/// POST before it can recompute and forward its own join request, per
/// spec.md §4.4 step 3 / §5.
pub async fn handle_client_to_server(
    session: &mut Session,
    body: &[u8],
    hijack_rx: oneshot::Receiver<mcproxy_common::Result<HijackedIdentifiers>>,
    session_host: &str,
) -> Result<Vec<u8>> {
    let (id, id_bytes) = peek_id(body)?;
    let payload = &body[id_bytes..];

    match (session.login_stage, id) {
        (LoginStage::AwaitingHandshake, HANDSHAKE_ID) => {
            let handshake = Handshake::decode(payload)?;
            match handshake.next_state {
                NEXT_STATE_STATUS => {
                    session.set_phase(Phase::Status);
                    session.login_stage = LoginStage::Done;
                }
                NEXT_STATE_LOGIN => {
                    session.set_phase(Phase::Login);
                    session.login_stage = LoginStage::AwaitingEncryptionRequest;
                }
                other => {
                    return Err(ProxyError::handshake(format!(
                        "unsupported handshake next_state {other}"
                    )));
                }
            }
            info!(
                "handshake: {}:{} -> next_state {}",
                handshake.server_address, handshake.server_port, handshake.next_state
            );
            Ok(body.to_vec())
        }
        (LoginStage::AwaitingEncryptionResponse, ENCRYPTION_RESPONSE_ID) => {
            let response = EncryptionResponse::decode(payload)?;
            let client_secret = session
                .key_broker
                .unwrap_from_client(&response.shared_secret_ct, &response.verify_token_ct)?;
            session.client_shared_secret = Some(client_secret);

            let server_secret = mcproxy_common::crypto::KeyBroker::generate_server_shared_secret();
            session.server_shared_secret = Some(server_secret);

            let upstream_token = session.upstream_verify_token.ok_or_else(|| {
                ProxyError::handshake("no upstream verification token stashed")
            })?;
            let (secret_ct, token_ct) = session
                .key_broker
                .wrap_for_upstream(&server_secret, &upstream_token)?;

            let rewritten = EncryptionResponse {
                shared_secret_ct: secret_ct,
                verify_token_ct: token_ct,
            };

            // The client's own launcher has already (or is about to have)
            // POSTed its session-join request to our impersonation
            // endpoint; wait for it, then re-sign and forward our own
            // join request to the real session service before this
            // EncryptionResponse reaches the real server.
            let hijacked = match hijack_rx.await {
                Ok(Ok(identifiers)) => Some(identifiers),
                Ok(Err(e)) => {
                    warn!("session-hijack endpoint failed: {e}");
                    None
                }
                Err(_) => {
                    warn!("session-hijack endpoint task was dropped before replying");
                    None
                }
            };

            if let (Some(identifiers), Some(server_pub_der), Some(server_id)) = (
                hijacked.as_ref(),
                session.key_broker.server_pub_der(),
                session.server_id.as_ref(),
            ) {
                let digest = compute_server_id_hash(server_id, &server_secret, server_pub_der);
                if let Err(e) = post_session_join(
                    session_host,
                    &identifiers.access_token,
                    &identifiers.selected_profile,
                    &digest,
                )
                .await
                {
                    warn!("session-join call failed: {e}");
                }
            } else {
                warn!("skipping session-join: missing hijacked identifiers or server key material");
            }
            session.hijacked = hijacked;

            session.enable_encryption = true;
            session.login_stage = LoginStage::AwaitingLoginSuccess;

            Ok(frame_body(ENCRYPTION_RESPONSE_ID, &rewritten.encode()))
        }
        (_, HANDSHAKE_ID) | (_, ENCRYPTION_RESPONSE_ID) => Err(ProxyError::handshake(format!(
            "packet id {id} arrived out of order in stage {:?}",
            session.login_stage
        ))),
        _ => Ok(body.to_vec()),
    }
}

/// Handles one server-to-client frame body during the pre-PLAY phases.
/// Returns the bytes to forward to the client (possibly rewritten).
pub fn handle_server_to_client(session: &mut Session, body: &[u8]) -> Result<Vec<u8>> {
    let (id, id_bytes) = peek_id(body)?;
    let payload = &body[id_bytes..];

    match (session.login_stage, id) {
        (LoginStage::AwaitingEncryptionRequest, ENCRYPTION_REQUEST_ID) => {
            let request = EncryptionRequest::decode(payload)?;
            if request.verify_token.len() != 4 {
                return Err(ProxyError::handshake(
                    "upstream verification token is not 4 bytes",
                ));
            }
            let mut upstream_token = [0u8; 4];
            upstream_token.copy_from_slice(&request.verify_token);

            session
                .key_broker
                .set_server_pub_der(request.public_key_der)?;
            session.server_id = Some(request.server_id.clone());
            session.upstream_verify_token = Some(upstream_token);

            let (proxy_pub_der, proxy_token) = session
                .key_broker
                .generate_proxy_keypair_and_token(session.rsa_key_bits)?;

            let rewritten = EncryptionRequest {
                server_id: request.server_id,
                public_key_der: proxy_pub_der,
                verify_token: proxy_token.to_vec(),
            };
            session.login_stage = LoginStage::AwaitingEncryptionResponse;

            Ok(frame_body(ENCRYPTION_REQUEST_ID, &rewritten.encode()))
        }
        (LoginStage::AwaitingLoginSuccess, SET_COMPRESSION_ID) => {
            let set_compression = SetCompression::decode(payload)?;
            session.compression_threshold = set_compression.threshold;
            Ok(body.to_vec())
        }
        (LoginStage::AwaitingLoginSuccess, LOGIN_SUCCESS_ID) => {
            session.set_phase(Phase::Play);
            session.login_stage = LoginStage::Done;
            Ok(body.to_vec())
        }
        (_, ENCRYPTION_REQUEST_ID) | (_, SET_COMPRESSION_ID) | (_, LOGIN_SUCCESS_ID) => {
            Err(ProxyError::handshake(format!(
                "packet id {id} arrived out of order in stage {:?}",
                session.login_stage
            )))
        }
        _ => Ok(body.to_vec()),
    }
}
