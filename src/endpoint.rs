//! Selects a usable address from the endpoints a service instance advertises.

use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid endpoint {endpoint:?}")]
    Invalid {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
}

/// Query parameter an endpoint uses to advertise TLS.
const SECURE_QUERY_KEY: &str = "isSecure";

/// Returns the address (`host[:port]`) of the first endpoint using `scheme`
/// whose security level matches `secure`.
///
/// Returns `Ok(None)` if no endpoint matches. Fails if an endpoint preceding
/// the match cannot be parsed.
pub fn parse_endpoint<S: AsRef<str>>(
    endpoints: &[S],
    scheme: &str,
    secure: bool,
) -> Result<Option<String>, Error> {
    for endpoint in endpoints {
        let endpoint = endpoint.as_ref();
        let url = Url::parse(endpoint).map_err(|source| Error::Invalid {
            endpoint: endpoint.to_string(),
            source,
        })?;
        if url.scheme() == scheme && is_secure(&url) == secure {
            return Ok(Some(address(&url)));
        }
    }
    Ok(None)
}

/// Reports whether an endpoint advertises `isSecure`.
///
/// A missing or unparseable flag counts as insecure.
pub fn is_secure(url: &Url) -> bool {
    url.query_pairs()
        .find(|(key, _)| key == SECURE_QUERY_KEY)
        .and_then(|(_, value)| parse_bool(&value))
        .unwrap_or(false)
}

fn address(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

// Accepts the spellings registries commonly emit for booleans.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
