//! Key broker: holds the two independent RSA key pairs a session needs to
//! re-originate its cryptographic pedigree — one relationship toward the
//! client, one toward the real upstream server — and wraps/unwraps the
//! shared secrets and verification tokens that flow between them.

use crate::error::{ProxyError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

/// Default modulus size for the proxy's own key pair.
pub const PROXY_KEY_BITS: usize = 1024;

/// A 4-byte verification token, fresh per session.
pub type VerifyToken = [u8; 4];

/// A 16-byte AES shared secret.
pub type SharedSecret = [u8; 16];

/// Holds both ends of the session's asymmetric-crypto pedigree.
///
/// `server_pub` is the real upstream's public key, captured off the wire
/// during the handshake. `proxy_keypair` is generated fresh per session and
/// handed to the client in place of `server_pub`, so the client believes it
/// is talking directly to the real server.
pub struct KeyBroker {
    server_pub_der: Option<Vec<u8>>,
    server_pub: Option<RsaPublicKey>,
    proxy_private: Option<RsaPrivateKey>,
    proxy_public_der: Option<Vec<u8>>,
    client_token: Option<VerifyToken>,
}

impl KeyBroker {
    pub fn new() -> Self {
        Self {
            server_pub_der: None,
            server_pub: None,
            proxy_private: None,
            proxy_public_der: None,
            client_token: None,
        }
    }

    /// Stashes the upstream's public key, received DER-encoded in the
    /// `EncryptionRequest` frame.
    pub fn set_server_pub_der(&mut self, der: Vec<u8>) -> Result<()> {
        let parsed = RsaPublicKey::from_pkcs1_der(&der)
            .map_err(|e| ProxyError::handshake(format!("bad server public key DER: {e}")))?;
        self.server_pub = Some(parsed);
        self.server_pub_der = Some(der);
        Ok(())
    }

    pub fn server_pub_der(&self) -> Option<&[u8]> {
        self.server_pub_der.as_deref()
    }

    /// Generates a fresh `key_bits`-wide key pair plus a 4-byte
    /// verification token for the client-facing side of the handshake.
    /// Returns the DER-encoded public key and the token to substitute into
    /// the forwarded `EncryptionRequest`.
    pub fn generate_proxy_keypair_and_token(
        &mut self,
        key_bits: usize,
    ) -> Result<(Vec<u8>, VerifyToken)> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, key_bits)
            .map_err(|e| ProxyError::handshake(format!("RSA keygen failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        let der = public
            .to_pkcs1_der()
            .map_err(|e| ProxyError::handshake(format!("DER encode failed: {e}")))?
            .as_bytes()
            .to_vec();

        let mut token = [0u8; 4];
        rng.fill_bytes(&mut token);

        self.proxy_private = Some(private);
        self.proxy_public_der = Some(der.clone());
        self.client_token = Some(token);
        Ok((der, token))
    }

    pub fn proxy_public_der(&self) -> Option<&[u8]> {
        self.proxy_public_der.as_deref()
    }

    /// Encrypts `shared_secret` and `token` under the upstream's public key
    /// with PKCS#1 v1.5 padding, for the `EncryptionResponse` sent onward
    /// to the server.
    pub fn wrap_for_upstream(
        &self,
        shared_secret: &SharedSecret,
        token: &VerifyToken,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let server_pub = self
            .server_pub
            .as_ref()
            .ok_or_else(|| ProxyError::handshake("no upstream public key set"))?;

        let mut rng = OsRng;
        let secret_ct = server_pub
            .encrypt(&mut rng, Pkcs1v15Encrypt, shared_secret.as_slice())
            .map_err(|e| ProxyError::handshake(format!("RSA wrap of shared secret failed: {e}")))?;
        let token_ct = server_pub
            .encrypt(&mut rng, Pkcs1v15Encrypt, token.as_slice())
            .map_err(|e| ProxyError::handshake(format!("RSA wrap of token failed: {e}")))?;

        Ok((secret_ct, token_ct))
    }

    /// Decrypts the client's `EncryptionResponse` ciphertexts with the
    /// proxy private key and verifies the returned token matches the one
    /// issued in [`generate_proxy_keypair_and_token`]. Returns the client's
    /// shared secret on success.
    pub fn unwrap_from_client(
        &self,
        secret_ct: &[u8],
        token_ct: &[u8],
    ) -> Result<SharedSecret> {
        let private = self
            .proxy_private
            .as_ref()
            .ok_or_else(|| ProxyError::handshake("no proxy private key generated"))?;
        let issued_token = self
            .client_token
            .as_ref()
            .ok_or_else(|| ProxyError::handshake("no verification token issued"))?;

        let secret = private
            .decrypt(Pkcs1v15Encrypt, secret_ct)
            .map_err(|e| ProxyError::handshake(format!("RSA unwrap of shared secret failed: {e}")))?;
        let token = private
            .decrypt(Pkcs1v15Encrypt, token_ct)
            .map_err(|e| ProxyError::handshake(format!("RSA unwrap of token failed: {e}")))?;

        if token.as_slice() != issued_token.as_slice() {
            return Err(ProxyError::handshake(
                "client verification token does not match the one issued",
            ));
        }

        if secret.len() != 16 {
            return Err(ProxyError::handshake(format!(
                "client shared secret has wrong length: {}",
                secret.len()
            )));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&secret);
        Ok(out)
    }

    /// Generates the shared secret the proxy presents to the upstream
    /// server in place of the client's real one.
    pub fn generate_server_shared_secret() -> SharedSecret {
        let mut rng = OsRng;
        let mut secret = [0u8; 16];
        rng.fill_bytes(&mut secret);
        secret
    }
}

impl Default for KeyBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream_keypair() -> (RsaPrivateKey, Vec<u8>) {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, PROXY_KEY_BITS).unwrap();
        let public = RsaPublicKey::from(&private);
        let der = public.to_pkcs1_der().unwrap().as_bytes().to_vec();
        (private, der)
    }

    #[test]
    fn test_generate_proxy_keypair_issues_distinct_token_and_key() {
        let mut broker = KeyBroker::new();
        let (der1, token1) = broker.generate_proxy_keypair_and_token(PROXY_KEY_BITS).unwrap();
        assert!(!der1.is_empty());

        let mut other = KeyBroker::new();
        let (der2, token2) = other.generate_proxy_keypair_and_token(PROXY_KEY_BITS).unwrap();
        assert_ne!(token1, token2, "tokens must be fresh per session");
        assert_ne!(der1, der2, "key pairs must be fresh per session");
    }

    #[test]
    fn test_wrap_unwrap_roundtrip_toward_client() {
        // The proxy's own keypair stands in as "server_pub" here since
        // wrap/unwrap toward the client both exercise the proxy private key.
        let mut broker = KeyBroker::new();
        let (der, issued_token) = broker.generate_proxy_keypair_and_token(PROXY_KEY_BITS).unwrap();

        // Simulate the client encrypting under the DER key it received.
        let client_pub = RsaPublicKey::from_pkcs1_der(&der).unwrap();
        let secret: SharedSecret = [0x42; 16];
        let mut rng = OsRng;
        let secret_ct = client_pub
            .encrypt(&mut rng, Pkcs1v15Encrypt, secret.as_slice())
            .unwrap();
        let token_ct = client_pub
            .encrypt(&mut rng, Pkcs1v15Encrypt, issued_token.as_slice())
            .unwrap();

        let unwrapped = broker.unwrap_from_client(&secret_ct, &token_ct).unwrap();
        assert_eq!(unwrapped, secret);
    }

    #[test]
    fn test_token_mismatch_is_fatal() {
        let mut broker = KeyBroker::new();
        let (der, _issued_token) = broker.generate_proxy_keypair_and_token(PROXY_KEY_BITS).unwrap();
        let client_pub = RsaPublicKey::from_pkcs1_der(&der).unwrap();
        let mut rng = OsRng;

        let secret: SharedSecret = [0x01; 16];
        let secret_ct = client_pub
            .encrypt(&mut rng, Pkcs1v15Encrypt, secret.as_slice())
            .unwrap();
        let wrong_token = [0xFFu8; 4];
        let token_ct = client_pub
            .encrypt(&mut rng, Pkcs1v15Encrypt, wrong_token.as_slice())
            .unwrap();

        let result = broker.unwrap_from_client(&secret_ct, &token_ct);
        assert!(matches!(result, Err(ProxyError::HandshakeFailed(_))));
    }

    #[test]
    fn test_wrap_for_upstream_roundtrip() {
        let (upstream_private, upstream_der) = upstream_keypair();
        let mut broker = KeyBroker::new();
        broker.set_server_pub_der(upstream_der).unwrap();

        let secret: SharedSecret = [0x07; 16];
        let token: VerifyToken = [1, 2, 3, 4];
        let (secret_ct, token_ct) = broker.wrap_for_upstream(&secret, &token).unwrap();

        let decrypted_secret = upstream_private.decrypt(Pkcs1v15Encrypt, &secret_ct).unwrap();
        let decrypted_token = upstream_private.decrypt(Pkcs1v15Encrypt, &token_ct).unwrap();
        assert_eq!(decrypted_secret, secret);
        assert_eq!(decrypted_token, token);
    }

    #[test]
    fn test_generate_server_shared_secret_is_random() {
        let a = KeyBroker::generate_server_shared_secret();
        let b = KeyBroker::generate_server_shared_secret();
        assert_ne!(a, b);
    }
}
