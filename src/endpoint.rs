//! Endpoint resolution and CLI value parsing for the wrapper binary.

use snafu::Snafu;
use std::collections::HashMap;

/// Name of the environment variable carrying the serving endpoint.
pub const CSI_ENDPOINT: &str = "CSI_ENDPOINT";

/// Endpoint parsing error variants.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum EndpointError {
    #[snafu(display("missing {} environment variable", CSI_ENDPOINT))]
    MissingEndpoint,
    #[snafu(display("non-empty network address is required"))]
    AddressRequired,
    #[snafu(display("invalid network address: {}", address))]
    InvalidAddress { address: String },
}

/// A serving endpoint: a tcp address or a unix domain socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port` as given; `*` stands for all interfaces.
    Tcp(String),
    Unix(String),
}

/// Parse an endpoint of the form `tcp://host:port` or `unix://path`.
/// A bare string is an implied unix socket path; a scheme other than the two
/// above is rejected.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint, EndpointError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return AddressRequired.fail();
    }
    match endpoint.split_once("://") {
        Some(("tcp", address)) if !address.is_empty() => Ok(Endpoint::Tcp(address.to_string())),
        Some(("unix", path)) if !path.is_empty() => Ok(Endpoint::Unix(path.to_string())),
        Some(_) => InvalidAddress {
            address: endpoint.to_string(),
        }
        .fail(),
        None => Ok(Endpoint::Unix(endpoint.to_string())),
    }
}

/// The endpoint named by the `CSI_ENDPOINT` environment variable.
pub fn csi_endpoint() -> Result<Endpoint, EndpointError> {
    match std::env::var(CSI_ENDPOINT) {
        Ok(value) if !value.trim().is_empty() => parse_endpoint(&value),
        _ => MissingEndpoint.fail(),
    }
}

/// Parse a whitespace separated list of `key=value` pairs.
///
/// Keys and values may be single or double quoted and a backslash escapes
/// the next character. Fields without a `=` are discarded; empty values are
/// kept.
pub fn parse_attribute_map(line: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();

    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    let flush =
        |key: &mut String, value: &mut String, in_value: &mut bool, pairs: &mut HashMap<_, _>| {
            if *in_value {
                pairs.insert(std::mem::take(key), std::mem::take(value));
            } else {
                key.clear();
            }
            *in_value = false;
        };

    for c in line.chars() {
        let buf = if in_value { &mut value } else { &mut key };
        if escaped {
            buf.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '\'' | '"' => match quote {
                Some(q) if q == c => quote = None,
                Some(_) => buf.push(c),
                None => quote = Some(c),
            },
            '=' if quote.is_none() && !in_value => in_value = true,
            c if c.is_whitespace() && quote.is_none() => {
                if in_value || !key.is_empty() {
                    flush(&mut key, &mut value, &mut in_value, &mut pairs);
                }
            }
            c => buf.push(c),
        }
    }
    if in_value || !key.is_empty() {
        flush(&mut key, &mut value, &mut in_value, &mut pairs);
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_endpoints_parse() {
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1"),
            Ok(Endpoint::Tcp("127.0.0.1".into()))
        );
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:8080"),
            Ok(Endpoint::Tcp("127.0.0.1:8080".into()))
        );
        assert_eq!(
            parse_endpoint("tcp://*:8080"),
            Ok(Endpoint::Tcp("*:8080".into()))
        );
    }

    #[test]
    fn unix_endpoints_parse() {
        assert_eq!(
            parse_endpoint("unix://path/to/sock.sock"),
            Ok(Endpoint::Unix("path/to/sock.sock".into()))
        );
        assert_eq!(
            parse_endpoint("unix:///path/to/sock.sock"),
            Ok(Endpoint::Unix("/path/to/sock.sock".into()))
        );
    }

    #[test]
    fn bare_paths_are_implied_sockets() {
        assert_eq!(
            parse_endpoint("sock.sock"),
            Ok(Endpoint::Unix("sock.sock".into()))
        );
        assert_eq!(
            parse_endpoint("/tmp/sock.sock"),
            Ok(Endpoint::Unix("/tmp/sock.sock".into()))
        );
    }

    #[test]
    fn blank_addresses_are_rejected() {
        assert_eq!(parse_endpoint(""), Err(EndpointError::AddressRequired));
        assert_eq!(parse_endpoint("    "), Err(EndpointError::AddressRequired));
    }

    #[test]
    fn unknown_schemes_are_invalid() {
        assert_eq!(
            parse_endpoint("tcp5://localhost:5000"),
            Err(EndpointError::InvalidAddress {
                address: "tcp5://localhost:5000".into()
            })
        );
        assert_eq!(
            parse_endpoint("unixpcket://path/to/sock.sock"),
            Err(EndpointError::InvalidAddress {
                address: "unixpcket://path/to/sock.sock".into()
            })
        );
    }

    #[test]
    fn one_pair() {
        let data = parse_attribute_map("k1=v1");
        assert_eq!(data.len(), 1);
        assert_eq!(data["k1"], "v1");
    }

    #[test]
    fn empty_line() {
        assert!(parse_attribute_map("").is_empty());
    }

    #[test]
    fn key_sans_value_is_dropped() {
        assert!(parse_attribute_map("k1").is_empty());
    }

    #[test]
    fn two_pairs() {
        let data = parse_attribute_map("k1=v1 k2=v2");
        assert_eq!(data.len(), 2);
        assert_eq!(data["k1"], "v1");
        assert_eq!(data["k2"], "v2");
    }

    #[test]
    fn two_pairs_with_extra_spacing() {
        let data = parse_attribute_map("k1=v1   k2=v2");
        assert_eq!(data.len(), 2);
        assert_eq!(data["k1"], "v1");
        assert_eq!(data["k2"], "v2");
    }

    #[test]
    fn empty_values_are_kept() {
        let data = parse_attribute_map("k1= k2=v2");
        assert_eq!(data.len(), 2);
        assert_eq!(data["k1"], "");
        assert_eq!(data["k2"], "v2");
    }

    #[test]
    fn quoted_values_keep_spaces() {
        let data = parse_attribute_map("k1='v 1'");
        assert_eq!(data["k1"], "v 1");

        let data = parse_attribute_map(r#"k1="v 1" k2=v2"#);
        assert_eq!(data.len(), 2);
        assert_eq!(data["k1"], "v 1");
        assert_eq!(data["k2"], "v2");
    }

    #[test]
    fn quoting_and_escaping() {
        let data = parse_attribute_map(r#""k1"=v1 'k2'='v2\'s'"#);
        assert_eq!(data.len(), 2);
        assert_eq!(data["k1"], "v1");
        assert_eq!(data["k2"], "v2's");

        let data = parse_attribute_map(r#""k1"=v1 'k2'='v2\\\'s'"#);
        assert_eq!(data.len(), 2);
        assert_eq!(data["k2"], r"v2\'s");
    }

    #[test]
    fn mixed_quoting() {
        let data = parse_attribute_map(r#"k1="v 1" k2='v 2 ' "k3 "=v3 "#);
        assert_eq!(data.len(), 3);
        assert_eq!(data["k1"], "v 1");
        assert_eq!(data["k2"], "v 2 ");
        assert_eq!(data["k3 "], "v3");
    }

    #[test]
    fn endpoint_env_round_trip() {
        std::env::set_var(CSI_ENDPOINT, "tcp://127.0.0.1:9090");
        assert_eq!(
            csi_endpoint(),
            Ok(Endpoint::Tcp("127.0.0.1:9090".into()))
        );
        std::env::remove_var(CSI_ENDPOINT);
        assert_eq!(csi_endpoint(), Err(EndpointError::MissingEndpoint));
    }
}
