//! Server endpoint parsing.
//!
//! The accepted format is `[ssl://]host[:port]`. The `ssl://` prefix selects
//! certificate-verified TLS; without it the connection is still encrypted (QUIC
//! always is) but the server certificate is not checked.

use std::{fmt, str::FromStr};

use leapbrush_proto::DEFAULT_PORT;

use crate::error::TransportError;

const SECURE_PREFIX: &str = "ssl://";

/// Credential mode selected by the endpoint string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// No prefix: server certificate is not verified
    Plaintext,
    /// `ssl://`: server certificate must chain to a trusted root
    Secure,
}

/// Parsed `[ssl://]host[:port]`. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl ServerEndpoint {
    /// Build an endpoint from parts.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self { scheme, host: host.into(), port }
    }

    /// Parse user input.
    ///
    /// Surrounding whitespace is ignored. The port defaults to 8402. IPv6
    /// literals must be bracketed (`[::1]:8402`).
    ///
    /// # Errors
    ///
    /// `TransportError::InvalidEndpoint` for an empty host, a malformed port,
    /// or any scheme prefix other than `ssl://`.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let trimmed = input.trim();
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = match trimmed.strip_prefix(SECURE_PREFIX) {
            Some(rest) => (Scheme::Secure, rest),
            None if trimmed.contains("://") => return Err(invalid("only ssl:// is supported")),
            None => (Scheme::Plaintext, trimmed),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) =
                bracketed.split_once(']').ok_or_else(|| invalid("unterminated '['"))?;
            let port = match after {
                "" => None,
                _ => Some(after.strip_prefix(':').ok_or_else(|| invalid("junk after ']'"))?),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(invalid("IPv6 addresses must be bracketed"));
                },
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if host.contains(['/', '@', ' ']) {
            return Err(invalid("host contains illegal characters"));
        }

        let port = match port {
            None => DEFAULT_PORT,
            Some(port) => match port.parse::<u16>() {
                Ok(0) | Err(_) => return Err(invalid("port must be 1-65535")),
                Ok(port) => port,
            },
        };

        Ok(Self { scheme, host: host.to_string(), port })
    }

    /// Credential mode.
    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or IP literal, without brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the server certificate is verified.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Secure
    }
}

impl FromStr for ServerEndpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == Scheme::Secure {
            f.write_str(SECURE_PREFIX)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn secure_prefix_selects_secure() {
        let endpoint = ServerEndpoint::parse("ssl://example.com:443").expect("parse");
        assert_eq!(endpoint, ServerEndpoint::new(Scheme::Secure, "example.com", 443));
    }

    #[test]
    fn no_prefix_selects_plaintext() {
        let endpoint = ServerEndpoint::parse("example.com:443").expect("parse");
        assert_eq!(endpoint, ServerEndpoint::new(Scheme::Plaintext, "example.com", 443));
    }

    #[test]
    fn port_defaults_when_omitted() {
        assert_eq!(ServerEndpoint::parse("localhost").expect("parse").port(), 8402);
        assert_eq!(ServerEndpoint::parse("ssl://localhost").expect("parse").port(), 8402);
    }

    #[test]
    fn whitespace_is_trimmed() {
        let endpoint = ServerEndpoint::parse("  10.0.0.5:9000 \n").expect("parse");
        assert_eq!(endpoint.host(), "10.0.0.5");
        assert_eq!(endpoint.port(), 9000);
    }

    #[test]
    fn bracketed_ipv6() {
        let endpoint = ServerEndpoint::parse("ssl://[::1]:8443").expect("parse");
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.port(), 8443);
        assert_eq!(endpoint.to_string(), "ssl://[::1]:8443");

        assert_eq!(ServerEndpoint::parse("[fe80::1]").expect("parse").port(), 8402);
    }

    #[test]
    fn rejects_malformed_input() {
        for input in [
            "",
            "   ",
            ":8402",
            "ssl://",
            "ssl://:443",
            "https://example.com",
            "grpc://example.com:8402",
            "example.com:",
            "example.com:0",
            "example.com:65536",
            "example.com:port",
            "::1",
            "[::1",
            "[::1]x",
            "user@example.com",
        ] {
            assert!(
                matches!(ServerEndpoint::parse(input), Err(TransportError::InvalidEndpoint { .. })),
                "{input:?} should be rejected"
            );
        }
    }

    fn host_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z0-9-]{0,15}(\\.[a-z][a-z0-9-]{0,10}){0,3}",
            any::<[u8; 4]>().prop_map(|o| format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3])),
            any::<[u16; 8]>().prop_map(|s| std::net::Ipv6Addr::from(s).to_string()),
        ]
    }

    proptest! {
        #[test]
        fn display_parses_back(
            host in host_strategy(),
            port in 1u16..,
            secure in any::<bool>(),
        ) {
            let scheme = if secure { Scheme::Secure } else { Scheme::Plaintext };
            let endpoint = ServerEndpoint::new(scheme, host, port);

            let reparsed = ServerEndpoint::parse(&endpoint.to_string()).expect("parse");
            prop_assert_eq!(reparsed, endpoint);
        }

        #[test]
        fn parse_never_panics(input in ".{0,40}") {
            let _ = ServerEndpoint::parse(&input);
        }
    }
}
