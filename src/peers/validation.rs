//! Input validation for peer operations
//!
//! Peer names and endpoints arrive from outside the crate (API layer, config
//! file) and are validated here before any resource is touched.
//!
//! # Rules
//!
//! - **Names**: 1-64 characters, starting with an alphanumeric character;
//!   alphanumerics, hyphens, underscores, and spaces after that.
//! - **Endpoints**: `host:port` where host is an IPv4 address or hostname and
//!   port is nonzero. The gateway endpoint is embedded verbatim into client
//!   configs, so anything that fails this check never reaches a rendered file.

use thiserror::Error;

/// Maximum peer name length
pub const MAX_NAME_LENGTH: usize = 64;

/// Validation error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Name is empty
    #[error("name cannot be empty")]
    EmptyName,

    /// Name is too long
    #[error("name exceeds maximum length of {MAX_NAME_LENGTH} characters: {length}")]
    NameTooLong { length: usize },

    /// Name must start with an alphanumeric character
    #[error("name must start with an alphanumeric character")]
    InvalidNameStart,

    /// Name contains a disallowed character
    #[error("name contains invalid character {0:?}")]
    InvalidNameCharacter(char),

    /// Endpoint is malformed
    #[error("invalid endpoint: {message}")]
    InvalidEndpoint { message: String },

    /// Public key is not a Base64-encoded 32-byte value
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Validate a client-supplied public key
pub fn validate_public_key(key: &str) -> Result<(), ValidationError> {
    if crate::keys::validate_key(key) {
        Ok(())
    } else {
        Err(ValidationError::InvalidPublicKey)
    }
}

/// Validate a peer name
pub fn validate_peer_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::NameTooLong { length: name.len() });
    }

    let mut chars = name.chars();
    let first = chars.next().expect("non-empty");
    if !first.is_ascii_alphanumeric() {
        return Err(ValidationError::InvalidNameStart);
    }
    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != ' ' {
            return Err(ValidationError::InvalidNameCharacter(c));
        }
    }
    Ok(())
}

/// Validate a `host:port` endpoint
///
/// Accepts IPv4 addresses and DNS hostnames. Rejects port 0, empty hosts,
/// and hosts containing anything outside hostname characters (which also
/// rules out whitespace and config-format metacharacters).
pub fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    let colon = endpoint
        .rfind(':')
        .ok_or_else(|| ValidationError::InvalidEndpoint {
            message: "missing port separator".into(),
        })?;

    let host = &endpoint[..colon];
    let port_str = &endpoint[colon + 1..];

    let port: u16 = port_str
        .parse()
        .map_err(|_| ValidationError::InvalidEndpoint {
            message: format!("invalid port number: {port_str}"),
        })?;
    if port == 0 {
        return Err(ValidationError::InvalidEndpoint {
            message: "port cannot be 0".into(),
        });
    }

    if host.is_empty() {
        return Err(ValidationError::InvalidEndpoint {
            message: "host cannot be empty".into(),
        });
    }

    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        return Ok(());
    }

    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ValidationError::InvalidEndpoint {
                message: format!("invalid hostname label: {label:?}"),
            });
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ValidationError::InvalidEndpoint {
                message: format!("invalid hostname characters in {label:?}"),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_peer_name("laptop").is_ok());
        assert!(validate_peer_name("office phone").is_ok());
        assert!(validate_peer_name("peer-node_1").is_ok());
        assert!(validate_peer_name("a").is_ok());
    }

    #[test]
    fn test_empty_name() {
        assert_eq!(validate_peer_name(""), Err(ValidationError::EmptyName));
    }

    #[test]
    fn test_name_too_long() {
        let long = "a".repeat(65);
        assert!(matches!(
            validate_peer_name(&long),
            Err(ValidationError::NameTooLong { length: 65 })
        ));
    }

    #[test]
    fn test_invalid_name_start() {
        assert_eq!(
            validate_peer_name("-laptop"),
            Err(ValidationError::InvalidNameStart)
        );
        assert_eq!(
            validate_peer_name(" laptop"),
            Err(ValidationError::InvalidNameStart)
        );
    }

    #[test]
    fn test_invalid_name_characters() {
        assert_eq!(
            validate_peer_name("lap\ntop"),
            Err(ValidationError::InvalidNameCharacter('\n'))
        );
        assert_eq!(
            validate_peer_name("peer@home"),
            Err(ValidationError::InvalidNameCharacter('@'))
        );
    }

    #[test]
    fn test_valid_endpoints() {
        assert!(validate_endpoint("203.0.113.10:51820").is_ok());
        assert!(validate_endpoint("vpn.example.com:51820").is_ok());
        assert!(validate_endpoint("localhost:8080").is_ok());
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(validate_endpoint("").is_err());
        assert!(validate_endpoint("203.0.113.10").is_err());
        assert!(validate_endpoint(":51820").is_err());
        assert!(validate_endpoint("203.0.113.10:0").is_err());
        assert!(validate_endpoint("203.0.113.10:99999").is_err());
        assert!(validate_endpoint("host name:51820").is_err());
        assert!(validate_endpoint("host\n:51820").is_err());
    }
}
