//! Percent-encoding and query/form parameter parsing.
//!
//! Decoding is deliberately forgiving: a `%` not followed by two hex digits
//! is kept literally (with a logged warning) instead of failing the whole
//! request, and `+` decodes to a space as in `application/x-www-form-urlencoded`.

use std::collections::BTreeMap;

use tracing::warn;

/// A multimap of decoded parameter names to their values, in name order.
///
/// Repeated keys accumulate values in the order they appeared.
pub type ParamMap = BTreeMap<String, Vec<String>>;

/// Percent-decodes `input`, converting `+` to space.
///
/// Invalid `%` sequences (truncated, or with non-hex digits) are preserved
/// literally and a warning is logged.
///
/// # Examples
///
/// ```
/// use hearth::http::url::decode;
///
/// assert_eq!(decode("a%20b+c"), "a b c");
/// assert_eq!(decode("100%25"), "100%");
/// assert_eq!(decode("bad%zzesc"), "bad%zzesc");
/// ```
pub fn decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|pair| {
                    let hi = (pair[0] as char).to_digit(16)?;
                    let lo = (pair[1] as char).to_digit(16)?;
                    Some((hi * 16 + lo) as u8)
                });
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        warn!(input, position = i, "invalid percent-encoding, keeping literal");
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    // Decoded bytes may form arbitrary sequences; keep whatever was sent.
    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encodes `input` over the unreserved set (RFC 3986 §2.3).
///
/// Spaces encode as `+`; alphanumerics and `-`, `_`, `.`, `~` pass through;
/// everything else becomes `%HH`.
///
/// # Examples
///
/// ```
/// use hearth::http::url::{decode, encode};
///
/// assert_eq!(encode("a b&c"), "a+b%26c");
/// assert_eq!(decode(&encode("naïve value")), "naïve value");
/// ```
pub fn encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Parses a query string (`key=value&key2=value2`) into a [`ParamMap`].
///
/// Keys and values are percent-decoded with [`decode`]; a pair without `=`
/// becomes a key with an empty value; pairs that decode to an empty key are
/// dropped with a warning.
pub fn parse_params(query: &str) -> ParamMap {
    let mut params = ParamMap::new();
    for pair in query.split('&') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (decode(k.trim()), decode(v.trim())),
            None => (decode(pair), String::new()),
        };
        if key.is_empty() {
            warn!(pair, "empty query parameter key");
            continue;
        }
        params.entry(key).or_default().push(value);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_plus_and_percent20_are_space() {
        assert_eq!(decode("a+b"), "a b");
        assert_eq!(decode("a%20b"), "a b");
    }

    #[test]
    fn decode_preserves_invalid_escapes() {
        assert_eq!(decode("%"), "%");
        assert_eq!(decode("%2"), "%2");
        assert_eq!(decode("%gg"), "%gg");
        assert_eq!(decode("50%-off"), "50%-off");
    }

    #[test]
    fn encode_decode_round_trip() {
        for input in ["hello world", "a/b?c=d&e", "tilde~dot.", "ünïcödé"] {
            assert_eq!(decode(&encode(input)), input);
        }
    }

    #[test]
    fn unreserved_passes_through() {
        assert_eq!(encode("AZaz09-_.~"), "AZaz09-_.~");
    }

    #[test]
    fn parse_simple_pairs() {
        let params = parse_params("q=rust&page=2");
        assert_eq!(params["q"], vec!["rust"]);
        assert_eq!(params["page"], vec!["2"]);
    }

    #[test]
    fn parse_repeated_key_accumulates() {
        let params = parse_params("tag=a&tag=b&tag=c");
        assert_eq!(params["tag"], vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_decodes_values() {
        let params = parse_params("name=John+Doe&city=S%C3%A3o");
        assert_eq!(params["name"], vec!["John Doe"]);
        assert_eq!(params["city"], vec!["São"]);
    }

    #[test]
    fn parse_key_without_value() {
        let params = parse_params("flag&x=1");
        assert_eq!(params["flag"], vec![""]);
        assert_eq!(params["x"], vec!["1"]);
    }

    #[test]
    fn parse_skips_empty_keys() {
        let params = parse_params("=orphan&&ok=1");
        assert!(!params.contains_key(""));
        assert_eq!(params["ok"], vec!["1"]);
    }
}
