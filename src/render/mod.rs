//! Config rendering for the AmneziaWG daemon
//!
//! Turns typed server and peer state into the daemon's INI-style config text.
//! Rendering is a pure function: identical inputs produce byte-identical
//! output, with peers emitted in ascending public-key order. The
//! synchronizer's digest-based change detection depends on that determinism.
//!
//! # Fail-closed validation
//!
//! Every value embedded in the text is validated first — keys must be
//! well-formed Base64, endpoints must parse, obfuscation parameters must be
//! consistent. A value that could smuggle an extra directive into the file
//! (an embedded newline, a key of the wrong shape) fails the render; a
//! corrupt config is never produced for the synchronizer to write.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::validate_key;
use crate::peers::validation::{validate_endpoint, ValidationError};

/// Keepalive interval emitted into client configs, in seconds
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// Error types for config rendering
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// A key field is not a Base64-encoded 32-byte value
    #[error("{field} is not a well-formed key")]
    InvalidKey {
        /// The config directive the key was destined for
        field: &'static str,
    },

    /// Two peers share a public key
    #[error("duplicate peer public key: {0}")]
    DuplicatePublicKey(String),

    /// The gateway endpoint would corrupt the config
    #[error(transparent)]
    InvalidEndpoint(#[from] ValidationError),

    /// The interface listen port is zero
    #[error("listen port cannot be 0")]
    InvalidListenPort,

    /// The interface prefix length is not a valid IPv4 prefix
    #[error("invalid interface prefix length: {0}")]
    InvalidPrefix(u8),

    /// Obfuscation parameters are inconsistent
    #[error("invalid obfuscation parameters: {0}")]
    Obfuscation(String),
}

/// AmneziaWG traffic-obfuscation parameters
///
/// These extend the WireGuard handshake with junk packets and rewritten
/// header magic. Defaults follow the daemon's stock profile; `validate`
/// enforces the relationships the daemon itself requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationParams {
    /// Junk packet count sent before the handshake
    #[serde(default = "default_jc")]
    pub jc: u32,
    /// Minimum junk packet size
    #[serde(default = "default_jmin")]
    pub jmin: u32,
    /// Maximum junk packet size
    #[serde(default = "default_jmax")]
    pub jmax: u32,
    /// Init packet junk prefix size
    #[serde(default)]
    pub s1: u32,
    /// Response packet junk prefix size
    #[serde(default)]
    pub s2: u32,
    /// Init packet magic header
    #[serde(default = "default_h1")]
    pub h1: u32,
    /// Response packet magic header
    #[serde(default = "default_h2")]
    pub h2: u32,
    /// Underload packet magic header
    #[serde(default = "default_h3")]
    pub h3: u32,
    /// Transport packet magic header
    #[serde(default = "default_h4")]
    pub h4: u32,
}

fn default_jc() -> u32 {
    4
}
fn default_jmin() -> u32 {
    50
}
fn default_jmax() -> u32 {
    1000
}
fn default_h1() -> u32 {
    1
}
fn default_h2() -> u32 {
    2
}
fn default_h3() -> u32 {
    3
}
fn default_h4() -> u32 {
    4
}

impl Default for ObfuscationParams {
    fn default() -> Self {
        Self {
            jc: default_jc(),
            jmin: default_jmin(),
            jmax: default_jmax(),
            s1: 0,
            s2: 0,
            h1: default_h1(),
            h2: default_h2(),
            h3: default_h3(),
            h4: default_h4(),
        }
    }
}

impl ObfuscationParams {
    /// Validate parameter relationships
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Obfuscation`] if `jmax < jmin` or `jc > 10`.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.jmax < self.jmin {
            return Err(RenderError::Obfuscation(format!(
                "jmax ({}) must be >= jmin ({})",
                self.jmax, self.jmin
            )));
        }
        if self.jc > 10 {
            return Err(RenderError::Obfuscation(format!(
                "jc ({}) must be at most 10",
                self.jc
            )));
        }
        Ok(())
    }

    fn write_lines(&self, out: &mut String) {
        let _ = writeln!(out, "Jc = {}", self.jc);
        let _ = writeln!(out, "Jmin = {}", self.jmin);
        let _ = writeln!(out, "Jmax = {}", self.jmax);
        let _ = writeln!(out, "S1 = {}", self.s1);
        let _ = writeln!(out, "S2 = {}", self.s2);
        let _ = writeln!(out, "H1 = {}", self.h1);
        let _ = writeln!(out, "H2 = {}", self.h2);
        let _ = writeln!(out, "H3 = {}", self.h3);
        let _ = writeln!(out, "H4 = {}", self.h4);
    }
}

/// The gateway's own interface settings, as rendered into `[Interface]`
#[derive(Debug, Clone)]
pub struct ServerProfile {
    /// Gateway private key, Base64
    pub private_key: String,
    /// Gateway interface address
    pub address: Ipv4Addr,
    /// Prefix length of the tunnel subnet
    pub prefix_len: u8,
    /// UDP listen port
    pub listen_port: u16,
    /// Obfuscation parameters, if the deployment uses them
    pub obfuscation: Option<ObfuscationParams>,
}

/// One peer as rendered into a `[Peer]` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// Peer public key, Base64
    pub public_key: String,
    /// Tunnel preshared key, Base64
    pub preshared_key: String,
    /// The peer's allocated tunnel address
    pub address: Ipv4Addr,
}

/// Everything needed to render a client's enrollment config
#[derive(Debug, Clone)]
pub struct ClientProfile {
    /// Client private key, Base64
    pub private_key: String,
    /// The client's allocated tunnel address
    pub address: Ipv4Addr,
    /// Tunnel preshared key, Base64
    pub preshared_key: String,
    /// Gateway public key, Base64
    pub server_public_key: String,
    /// Public `host:port` the client dials
    pub server_endpoint: String,
    /// DNS servers pushed to the client
    pub dns: (Ipv4Addr, Ipv4Addr),
    /// Obfuscation parameters; must match the gateway's
    pub obfuscation: Option<ObfuscationParams>,
}

/// Render the gateway's full config from its profile and active peers
///
/// Peers are sorted by public key before rendering, so the output is a pure
/// function of the input set regardless of iteration order upstream.
///
/// # Errors
///
/// Fails closed on any field that would produce a malformed config.
pub fn render_server_config(
    server: &ServerProfile,
    peers: &[PeerEntry],
) -> Result<String, RenderError> {
    if !validate_key(&server.private_key) {
        return Err(RenderError::InvalidKey {
            field: "PrivateKey",
        });
    }
    if server.listen_port == 0 {
        return Err(RenderError::InvalidListenPort);
    }
    if server.prefix_len > 32 {
        return Err(RenderError::InvalidPrefix(server.prefix_len));
    }
    if let Some(obfuscation) = &server.obfuscation {
        obfuscation.validate()?;
    }

    let mut sorted: Vec<&PeerEntry> = peers.iter().collect();
    sorted.sort_by(|a, b| a.public_key.cmp(&b.public_key));

    for pair in sorted.windows(2) {
        if pair[0].public_key == pair[1].public_key {
            return Err(RenderError::DuplicatePublicKey(pair[0].public_key.clone()));
        }
    }

    let mut out = String::new();
    out.push_str("[Interface]\n");
    let _ = writeln!(out, "PrivateKey = {}", server.private_key);
    let _ = writeln!(out, "Address = {}/{}", server.address, server.prefix_len);
    let _ = writeln!(out, "ListenPort = {}", server.listen_port);
    if let Some(obfuscation) = &server.obfuscation {
        obfuscation.write_lines(&mut out);
    }

    for peer in sorted {
        if !validate_key(&peer.public_key) {
            return Err(RenderError::InvalidKey { field: "PublicKey" });
        }
        if !validate_key(&peer.preshared_key) {
            return Err(RenderError::InvalidKey {
                field: "PresharedKey",
            });
        }

        out.push_str("\n[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        let _ = writeln!(out, "PresharedKey = {}", peer.preshared_key);
        let _ = writeln!(out, "AllowedIPs = {}/32", peer.address);
    }

    Ok(out)
}

/// Render the enrollment config handed to a client application
///
/// # Errors
///
/// Fails closed on any field that would produce a malformed config.
pub fn render_client_config(client: &ClientProfile) -> Result<String, RenderError> {
    if !validate_key(&client.private_key) {
        return Err(RenderError::InvalidKey {
            field: "PrivateKey",
        });
    }
    if !validate_key(&client.preshared_key) {
        return Err(RenderError::InvalidKey {
            field: "PresharedKey",
        });
    }
    if !validate_key(&client.server_public_key) {
        return Err(RenderError::InvalidKey { field: "PublicKey" });
    }
    validate_endpoint(&client.server_endpoint)?;
    if let Some(obfuscation) = &client.obfuscation {
        obfuscation.validate()?;
    }

    let mut out = String::new();
    out.push_str("[Interface]\n");
    let _ = writeln!(out, "PrivateKey = {}", client.private_key);
    let _ = writeln!(out, "Address = {}/32", client.address);
    let _ = writeln!(out, "DNS = {}, {}", client.dns.0, client.dns.1);
    if let Some(obfuscation) = &client.obfuscation {
        obfuscation.write_lines(&mut out);
    }

    out.push_str("\n[Peer]\n");
    let _ = writeln!(out, "PublicKey = {}", client.server_public_key);
    let _ = writeln!(out, "PresharedKey = {}", client.preshared_key);
    out.push_str("AllowedIPs = 0.0.0.0/0\n");
    let _ = writeln!(out, "Endpoint = {}", client.server_endpoint);
    let _ = writeln!(out, "PersistentKeepalive = {PERSISTENT_KEEPALIVE_SECS}");

    Ok(out)
}
