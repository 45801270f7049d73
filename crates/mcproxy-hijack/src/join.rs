//! The outbound session-join call: recomputes the `serverId` hash under
//! the proxy's own shared secret and public key, then forwards it to the
//! real upstream session-validation service so the original client's login
//! still authenticates.

use mcproxy_common::error::ProxyError;
use mcproxy_common::Result;
use num_bigint::BigInt;
use serde::Serialize;
use sha1::{Digest, Sha1};

/// Computes the Mojang-style `serverId` hash: SHA-1 over
/// `server_id || shared_secret || server_pub_der`, rendered as a signed
/// big-endian hex string (two's complement, `-` prefix if the high bit of
/// the digest is set, no padding after the sign).
pub fn compute_server_id_hash(server_id: &str, shared_secret: &[u8], server_pub_der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(shared_secret);
    hasher.update(server_pub_der);
    let digest = hasher.finalize();

    BigInt::from_signed_bytes_be(&digest).to_str_radix(16)
}

#[derive(Serialize)]
struct JoinRequest<'a> {
    #[serde(rename = "accessToken")]
    access_token: &'a str,
    #[serde(rename = "selectedProfile")]
    selected_profile: &'a str,
    #[serde(rename = "serverId")]
    server_id: &'a str,
}

/// Issues `POST https://<session_host>/session/minecraft/join` with the
/// recomputed digest. A non-2xx response is logged and otherwise ignored —
/// per spec §4.5/§9, the upstream game server will close the connection on
/// its own if authentication actually failed, and the source's behavior on
/// this path is deliberately preserved rather than tightened.
pub async fn post_session_join(
    session_host: &str,
    access_token: &str,
    selected_profile: &str,
    server_id_digest: &str,
) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("https://{session_host}/session/minecraft/join");
    let body = JoinRequest {
        access_token,
        selected_profile,
        server_id: server_id_digest,
    };

    let response = client
        .post(&url)
        .header("Content-Type", "application/json; charset=utf-8")
        .json(&body)
        .send()
        .await
        .map_err(|e| ProxyError::hijack(format!("session-join request failed: {e}")))?;

    if !response.status().is_success() {
        tracing::warn!(
            "upstream session service returned {} for join request",
            response.status()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest_vector_simon() {
        let digest = compute_server_id_hash("simon", &[], &[]);
        assert_eq!(digest, "88e16a1019277b15d58faf0541e11910eb756f6");
    }

    #[test]
    fn test_digest_with_high_bit_set_renders_with_minus_sign() {
        // "jeb_" is the textbook reference vector for this algorithm
        // (wiki.vg's "Protocol Encryption" page): SHA-1("jeb_") has its
        // high bit set, so the two's-complement rendering carries a sign.
        let digest = compute_server_id_hash("jeb_", &[], &[]);
        assert!(digest.starts_with('-'));
        assert_eq!(digest, "-7c9d5b0044c130109a5d7b5fb5c317c02b4e28c1");
    }

    #[test]
    fn test_digest_without_high_bit_set_has_no_sign() {
        // "Notch" is the same reference vector's positive counterpart.
        let digest = compute_server_id_hash("Notch", &[], &[]);
        assert!(!digest.starts_with('-'));
        assert_eq!(digest, "4ed1f46bbe04bc756bcb17c0c7ce3e4632f06a48");
    }

    #[test]
    fn test_digest_strips_leading_zeros_after_sign() {
        // Regardless of sign, the rendering never carries leading zero
        // nibbles the way a fixed-width hex-of-bytes encoding would.
        let digest = compute_server_id_hash("jeb_", &[], &[]);
        let magnitude = digest.trim_start_matches('-');
        assert!(!magnitude.starts_with('0') || magnitude == "0");
    }

    #[test]
    fn test_digest_changes_with_inputs() {
        let a = compute_server_id_hash("server-a", &[1, 2, 3], &[4, 5, 6]);
        let b = compute_server_id_hash("server-b", &[1, 2, 3], &[4, 5, 6]);
        assert_ne!(a, b);
    }
}
