//! `Session` — the root entity of one proxied connection. Owned entirely
//! by the packet pump; scoped to one connection's lifetime and dropped at
//! teardown. No process-wide mutable state is needed beyond the listening
//! sockets and the OS RNG, per Design Notes §9 "Global session state".

use mcproxy_common::cipher::CipherState;
use mcproxy_common::crypto::KeyBroker;
use mcproxy_common::packet::{Phase, PacketRegistry};
use mcproxy_common::trace::TraceWriter;
use mcproxy_hijack::HijackedIdentifiers;

/// Where a LOGIN-bound session currently sits in the five-step handshake
/// sequence (spec.md §4.4). `Done` means the handshake has finished or the
/// session went to STATUS instead — either way, subsequent frames are no
/// longer routed through the handshake state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStage {
    AwaitingHandshake,
    AwaitingEncryptionRequest,
    AwaitingEncryptionResponse,
    AwaitingLoginSuccess,
    Done,
}

pub struct Session {
    pub phase: Phase,
    pub login_stage: LoginStage,

    /// Negative disables compression. Set by `SetCompression`.
    pub compression_threshold: i32,

    /// Modulus size for the proxy's client-facing key pair, from
    /// `ProxyConfig::rsa_key_bits`.
    pub rsa_key_bits: usize,

    pub key_broker: KeyBroker,

    /// Gates the cipher layer. `encryption_active` is monotonic: once set,
    /// never cleared.
    pub enable_encryption: bool,
    pub encryption_active: bool,
    pub client_cipher: CipherState,
    pub server_cipher: CipherState,

    /// The client's real shared secret, unwrapped in step 3. This becomes
    /// `client_cipher`'s key once `encryption_active` flips.
    pub client_shared_secret: Option<[u8; 16]>,
    /// The secret the proxy re-originates toward the real server. This
    /// becomes `server_cipher`'s key once `encryption_active` flips.
    pub server_shared_secret: Option<[u8; 16]>,

    /// The real server's verification token from `EncryptionRequest`,
    /// re-wrapped and echoed back to it in step 3.
    pub upstream_verify_token: Option<[u8; 4]>,
    /// `server_id` from `EncryptionRequest`, forwarded verbatim to the
    /// client and also fed into the session-hijack digest.
    pub server_id: Option<String>,

    /// The three fields captured off the session-hijack endpoint.
    pub hijacked: Option<HijackedIdentifiers>,

    pub registry: PacketRegistry,
    pub trace: Option<TraceWriter>,

    /// Synthetic frames queued to be sent back toward the client — the
    /// originating side of whatever client-bound traffic is currently being
    /// drained — rather than forwarded on to the real server (spec.md §4.6,
    /// GLOSSARY "retour buffer"). Flushed once per pump iteration, encoded
    /// and encrypted with `client_cipher`: the inverse of the
    /// `server_cipher` context that iteration's forwarded traffic goes out
    /// under.
    retour_to_client: Vec<Vec<u8>>,
    /// Same, but for frames queued back toward the real server while
    /// draining server-bound traffic; flushed under `server_cipher`, the
    /// inverse of that iteration's `client_cipher` forwarding context.
    retour_to_upstream: Vec<Vec<u8>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            login_stage: LoginStage::AwaitingHandshake,
            compression_threshold: -1,
            rsa_key_bits: mcproxy_common::crypto::PROXY_KEY_BITS,
            key_broker: KeyBroker::new(),
            enable_encryption: false,
            encryption_active: false,
            client_cipher: CipherState::default(),
            server_cipher: CipherState::default(),
            client_shared_secret: None,
            server_shared_secret: None,
            upstream_verify_token: None,
            server_id: None,
            hijacked: None,
            registry: PacketRegistry::new(),
            trace: None,
            retour_to_client: Vec::new(),
            retour_to_upstream: Vec::new(),
        }
    }

    /// Queues a synthetic frame body to be injected back toward the client
    /// on this pump iteration, instead of (or alongside) whatever is being
    /// forwarded to the real server.
    pub fn queue_retour_to_client(&mut self, body: Vec<u8>) {
        self.retour_to_client.push(body);
    }

    /// Queues a synthetic frame body to be injected back toward the real
    /// server on this pump iteration, instead of (or alongside) whatever is
    /// being forwarded to the client.
    pub fn queue_retour_to_upstream(&mut self, body: Vec<u8>) {
        self.retour_to_upstream.push(body);
    }

    /// Drains and returns whatever retour frames were queued toward the
    /// client since the last flush.
    pub fn take_retour_to_client(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.retour_to_client)
    }

    /// Drains and returns whatever retour frames were queued toward the
    /// real server since the last flush.
    pub fn take_retour_to_upstream(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.retour_to_upstream)
    }

    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Advances `phase`. Debug-asserts the monotonicity invariant from
    /// spec.md §3 — phases only ever move forward.
    pub fn set_phase(&mut self, next: Phase) {
        debug_assert!(next >= self.phase, "phase must only move forward");
        self.phase = next;
    }

    /// Whether compression framing (§4.1) is enabled for this session.
    pub fn compression_enabled(&self) -> bool {
        self.compression_threshold >= 0
    }

    /// Installs both cipher contexts from the two shared secrets negotiated
    /// during the handshake and raises `encryption_active`. Called once,
    /// at the start of the pump iteration after `enable_encryption` was
    /// set — never re-entered, since `encryption_active` is monotonic.
    pub fn activate_encryption(&mut self) {
        if self.encryption_active {
            return;
        }
        if let Some(secret) = self.client_shared_secret {
            self.client_cipher.install(&secret);
        }
        if let Some(secret) = self.server_shared_secret {
            self.server_cipher.install(&secret);
        }
        self.encryption_active = true;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_starts_idle_and_plaintext() {
        let session = Session::new();
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.login_stage, LoginStage::AwaitingHandshake);
        assert!(!session.compression_enabled());
        assert!(!session.encryption_active);
    }

    #[test]
    fn test_activate_encryption_is_idempotent_and_monotonic() {
        let mut session = Session::new();
        session.client_shared_secret = Some([0x11; 16]);
        session.server_shared_secret = Some([0x22; 16]);

        session.activate_encryption();
        assert!(session.encryption_active);
        assert!(session.client_cipher.is_encrypted());
        assert!(session.server_cipher.is_encrypted());

        // A second call must not panic or reset cipher state.
        session.activate_encryption();
        assert!(session.encryption_active);
    }

    #[test]
    #[should_panic(expected = "phase must only move forward")]
    fn test_phase_cannot_move_backward() {
        let mut session = Session::new();
        session.set_phase(Phase::Play);
        session.set_phase(Phase::Login);
    }

    #[test]
    fn test_retour_queues_are_independent_and_drain_on_take() {
        let mut session = Session::new();
        session.queue_retour_to_client(vec![1, 2, 3]);
        session.queue_retour_to_client(vec![4]);
        session.queue_retour_to_upstream(vec![9]);

        let to_client = session.take_retour_to_client();
        assert_eq!(to_client, vec![vec![1, 2, 3], vec![4]]);
        assert!(session.take_retour_to_client().is_empty());

        let to_upstream = session.take_retour_to_upstream();
        assert_eq!(to_upstream, vec![vec![9]]);
        assert!(session.take_retour_to_upstream().is_empty());
    }
}
