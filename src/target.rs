//! Describes what a [crate::resolver::Resolver] should resolve.

use std::fmt;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
#[error("Invalid target {address:?}")]
pub struct ParseError {
    address: String,
    #[source]
    source: url::ParseError,
}

/// A parsed resolution request, e.g. `discovery:///helloworld`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    /// The service name to watch within the registry.
    ///
    /// This is the path of the address without its leading slash, and
    /// may be empty.
    pub endpoint: String,
}

impl Target {
    /// Parses a user-supplied address.
    ///
    /// Addresses without a `scheme://` prefix are treated as `http://` when
    /// `insecure` is set, and `https://` otherwise.
    pub fn parse(address: &str, insecure: bool) -> Result<Self, ParseError> {
        let address = if address.contains("://") {
            address.to_string()
        } else if insecure {
            format!("http://{address}")
        } else {
            format!("https://{address}")
        };

        let url = Url::parse(&address).map_err(|source| ParseError {
            address: address.clone(),
            source,
        })?;

        let host = url.host_str().unwrap_or_default();
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let endpoint = url.path().strip_prefix('/').unwrap_or_default();

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
            endpoint: endpoint.to_string(),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_without_scheme() {
        let target = Target::parse("127.0.0.1:8000", true).unwrap();
        assert_eq!(target.scheme, "http");
        assert_eq!(target.authority, "127.0.0.1:8000");
        assert_eq!(target.endpoint, "");

        let target = Target::parse("127.0.0.1:8000", false).unwrap();
        assert_eq!(target.scheme, "https");
        assert_eq!(target.authority, "127.0.0.1:8000");
    }

    #[test]
    fn test_parse_with_scheme_ignores_insecure_flag() {
        for insecure in [true, false] {
            let target = Target::parse("discovery://default/helloworld", insecure).unwrap();
            assert_eq!(target.scheme, "discovery");
            assert_eq!(target.authority, "default");
            assert_eq!(target.endpoint, "helloworld");
        }
    }

    #[test]
    fn test_parse_empty_authority() {
        let target = Target::parse("discovery:///helloworld", false).unwrap();
        assert_eq!(target.scheme, "discovery");
        assert_eq!(target.authority, "");
        assert_eq!(target.endpoint, "helloworld");
    }

    #[test]
    fn test_parse_root_path_is_empty_endpoint() {
        let target = Target::parse("http://example.com/", false).unwrap();
        assert_eq!(target.authority, "example.com");
        assert_eq!(target.endpoint, "");
    }

    #[test]
    fn test_parse_ipv6_authority() {
        let target = Target::parse("[::1]:9000/greeter", true).unwrap();
        assert_eq!(target.scheme, "http");
        assert_eq!(target.authority, "[::1]:9000");
        assert_eq!(target.endpoint, "greeter");
    }

    #[test]
    fn test_parse_malformed() {
        let err = Target::parse("http://[::1", false).unwrap_err();
        assert!(err.to_string().contains("http://[::1"), "{err}");

        assert!(Target::parse("example.com:99999", true).is_err());
    }

    #[test]
    fn test_display() {
        let target = Target::parse("discovery://default/helloworld", false).unwrap();
        assert_eq!(target.to_string(), "discovery://default/helloworld");
    }
}
