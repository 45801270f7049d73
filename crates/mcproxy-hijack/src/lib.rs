//! The session-hijack endpoint: a tiny HTTP/1.1 impersonation of the
//! upstream session-validation service, plus the outbound HTTPS call that
//! re-signs the real join request with the proxy's own cryptographic
//! pedigree (spec.md §4.5).

pub mod endpoint;
pub mod join;

pub use endpoint::{spawn, HijackedIdentifiers};
pub use join::{compute_server_id_hash, post_session_join};
