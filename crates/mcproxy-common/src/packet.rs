//! The packet registry: a lookup table keyed by `(direction, phase, id)`
//! that turns a frame's raw body into a typed [`Packet`] when a decoder is
//! registered, and forwards it as an opaque blob otherwise.
//!
//! Per-packet semantic decoders for gameplay packets are out of scope for
//! this core (see `spec.md` §1) — the registry ships empty and every PLAY
//! packet is forwarded byte-for-byte until a caller registers a decoder for
//! it. The handshake packets the core *does* understand (`Handshake`,
//! `EncryptionRequest`, `EncryptionResponse`, `SetCompression`,
//! `LoginSuccess`) are decoded directly by the handshake state machine in
//! `mcproxy-session` rather than through this registry, since the state
//! machine needs to rewrite their fields before re-framing them.

use crate::error::Result;
use crate::framing::read_varint;
use std::collections::HashMap;
use std::fmt;

/// Which side a frame is travelling toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// The coarse protocol phase a frame belongs to. `Idle` never owns frames
/// of its own — it's the pre-handshake state before the `Handshake` packet
/// picks `Status` or `Login`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    Status,
    Login,
    Play,
}

/// Composite registry key: a frame is dispatched by the direction it's
/// travelling, the phase the session is in, and its packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKey {
    pub direction: Direction,
    pub phase: Phase,
    pub id: u32,
}

/// A decoded packet's structured form. Implementors own whatever
/// sub-buffers they parsed out of the body; Rust's ownership model retires
/// the source table's explicit "free" routine — the value is simply
/// dropped when the `Packet` that holds it is dropped.
pub trait PacketBody: fmt::Debug + Send {
    /// Re-encodes this packet body to wire bytes (without the id varint).
    fn encode(&self) -> Result<Vec<u8>>;

    /// Diagnostic rendering for trace/log output.
    fn dump(&self) -> String {
        format!("{self:?}")
    }
}

/// A tagged variant over a registry-decoded packet or an unrecognized one
/// carried through as raw bytes.
pub enum Packet {
    Opaque {
        id: u32,
        /// The full original frame body (id varint + payload), re-emitted
        /// verbatim.
        raw: Vec<u8>,
    },
    Decoded {
        id: u32,
        body: Box<dyn PacketBody>,
        /// When false, [`Packet::to_bytes`] re-emits `raw` verbatim
        /// instead of re-encoding `body`, preserving byte-for-byte
        /// fidelity for anything the caller didn't actually touch.
        modified: bool,
        raw: Vec<u8>,
    },
}

impl Packet {
    pub fn id(&self) -> u32 {
        match self {
            Packet::Opaque { id, .. } | Packet::Decoded { id, .. } => *id,
        }
    }

    /// Marks a decoded packet as modified, so the next [`Packet::to_bytes`]
    /// re-encodes `body` instead of replaying the original bytes. No-op on
    /// an `Opaque` packet, which has no structured form to re-encode.
    pub fn mark_modified(&mut self) {
        if let Packet::Decoded { modified, .. } = self {
            *modified = true;
        }
    }

    /// Re-frames this packet to a body suitable for [`crate::framing`]'s
    /// encoders (id varint followed by payload).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Packet::Opaque { raw, .. } => Ok(raw.clone()),
            Packet::Decoded {
                id,
                body,
                modified,
                raw,
            } => {
                if !*modified {
                    return Ok(raw.clone());
                }
                let mut out = Vec::new();
                crate::framing::write_varint(&mut out, *id);
                out.extend_from_slice(&body.encode()?);
                Ok(out)
            }
        }
    }
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn PacketBody>>;

/// Compile-time-registered, runtime-looked-up table of packet decoders.
/// Empty by default; callers register decoders for the packet kinds they
/// care about and everything else forwards as [`Packet::Opaque`].
#[derive(Default)]
pub struct PacketRegistry {
    decoders: HashMap<PacketKey, DecodeFn>,
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, direction: Direction, phase: Phase, id: u32, decode: DecodeFn) {
        self.decoders.insert(
            PacketKey {
                direction,
                phase,
                id,
            },
            decode,
        );
    }

    pub fn has_handler(&self, direction: Direction, phase: Phase, id: u32) -> bool {
        self.decoders.contains_key(&PacketKey {
            direction,
            phase,
            id,
        })
    }

    /// Decodes a frame body into a [`Packet`]. `body` is the full post-
    /// compression-envelope frame payload, starting with the packet-id
    /// varint. Unregistered `(direction, phase, id)` combinations produce
    /// [`Packet::Opaque`] rather than an error — per §4.7, an unknown
    /// packet type is not a registry error.
    pub fn decode(&self, direction: Direction, phase: Phase, body: &[u8]) -> Result<Packet> {
        let (id, id_bytes) = read_varint(body)?
            .ok_or_else(|| crate::error::ProxyError::framing("frame body missing packet id"))?;
        let key = PacketKey {
            direction,
            phase,
            id,
        };
        match self.decoders.get(&key) {
            Some(decode) => {
                let payload = &body[id_bytes..];
                let decoded = decode(payload)?;
                Ok(Packet::Decoded {
                    id,
                    body: decoded,
                    modified: false,
                    raw: body.to_vec(),
                })
            }
            None => Ok(Packet::Opaque {
                id,
                raw: body.to_vec(),
            }),
        }
    }
}
