//! Proxy configuration, layered the way `ro2-login`/`ro2-lobby`/`ro2-world`
//! declare their config stack (the `config` crate over a `.env` loaded by
//! `dotenvy`) even though none of this repo's binaries skip it the way the
//! teacher's did.

use serde::Deserialize;
use std::path::PathBuf;

/// Compiled-in defaults, used when no environment override or `.env` entry
/// is present.
const DEFAULT_LISTEN_PORT: u16 = 25565;
const DEFAULT_UPSTREAM_HOST: &str = "mc.hypixel.net";
const DEFAULT_UPSTREAM_PORT: u16 = 25565;
const DEFAULT_HIJACK_PORT: u16 = 25566;
const DEFAULT_SESSION_HOST: &str = "sessionserver.mojang.com";
const DEFAULT_TRACE_DIR: &str = "saved";
const DEFAULT_RSA_KEY_BITS: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Local port the proxy listens on for the real client.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Hostname of the real upstream server to re-originate a connection
    /// to. Overridden by `mcproxy`'s CLI positional argument.
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Port of the real upstream server.
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    /// Local port the session-hijack HTTP/1.1 endpoint binds to.
    #[serde(default = "default_hijack_port")]
    pub hijack_port: u16,

    /// Host of the real session-validation service the recomputed join
    /// request is forwarded to.
    #[serde(default = "default_session_host")]
    pub session_host: String,

    /// Directory `.mcs` trace files are written under.
    #[serde(default = "default_trace_dir")]
    pub trace_dir: PathBuf,

    /// RSA modulus size for the proxy's own (client-facing) key pair.
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}
fn default_upstream_host() -> String {
    DEFAULT_UPSTREAM_HOST.to_string()
}
fn default_upstream_port() -> u16 {
    DEFAULT_UPSTREAM_PORT
}
fn default_hijack_port() -> u16 {
    DEFAULT_HIJACK_PORT
}
fn default_session_host() -> String {
    DEFAULT_SESSION_HOST.to_string()
}
fn default_trace_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TRACE_DIR)
}
fn default_rsa_key_bits() -> usize {
    DEFAULT_RSA_KEY_BITS
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            upstream_host: default_upstream_host(),
            upstream_port: default_upstream_port(),
            hijack_port: default_hijack_port(),
            session_host: default_session_host(),
            trace_dir: default_trace_dir(),
            rsa_key_bits: default_rsa_key_bits(),
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from (in increasing priority) compiled-in
    /// defaults, a `.env` file in the working directory, and
    /// `MCPROXY_`-prefixed environment variables, matching the
    /// `config`+`dotenvy` layering the teacher's binaries declare.
    pub fn load() -> anyhow::Result<Self> {
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let defaults = ProxyConfig::default();
        let built = config::Config::builder()
            .set_default("listen_port", defaults.listen_port)?
            .set_default("upstream_host", defaults.upstream_host)?
            .set_default("upstream_port", defaults.upstream_port)?
            .set_default("hijack_port", defaults.hijack_port)?
            .set_default("session_host", defaults.session_host)?
            .set_default(
                "trace_dir",
                defaults.trace_dir.to_string_lossy().into_owned(),
            )?
            .set_default("rsa_key_bits", defaults.rsa_key_bits as i64)?
            .add_source(config::Environment::with_prefix("MCPROXY"))
            .build()?;

        Ok(built.try_deserialize()?)
    }
}
