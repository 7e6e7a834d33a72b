// Shareable config links

//! Config exchange codec
//!
//! Turns a client configuration into a single `vpn://` string and back. The
//! payload is a 4-byte big-endian uncompressed length followed by a zlib
//! stream, base64url-encoded without padding. Payloads without a zlib header
//! are accepted as plain text.

use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// URI scheme token prefixed to every encoded link
pub const SCHEME: &str = "vpn://";

const COMPRESSION_LEVEL: u32 = 8;
const LENGTH_PREFIX: usize = 4;

/// Encode config text as a `vpn://` link
pub fn encode(text: &str) -> Result<String> {
    let bytes = text.as_bytes();
    let declared = u32::try_from(bytes.len())
        .map_err(|_| Error::CorruptPayload(format!("{} bytes is too large to encode", bytes.len())))?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(bytes)?;

    let mut payload = declared.to_be_bytes().to_vec();
    payload.extend(encoder.finish()?);

    Ok(format!("{}{}", SCHEME, URL_SAFE_NO_PAD.encode(payload)))
}

/// Decode a `vpn://` link (the scheme token is optional) back to config text
pub fn decode(link: &str) -> Result<String> {
    let body = link.trim();
    let body = body.strip_prefix(SCHEME).unwrap_or(body);
    let raw = URL_SAFE_NO_PAD
        .decode(body.trim_end_matches('='))
        .map_err(|e| Error::CorruptPayload(format!("invalid base64url: {}", e)))?;

    let bytes = if has_zlib_header(&raw) {
        inflate(&raw)?
    } else {
        log::debug!("Payload has no zlib container, treating it as plain text");
        raw
    };

    String::from_utf8(bytes).map_err(|e| Error::CorruptPayload(format!("not UTF-8: {}", e)))
}

/// Whether a zlib stream header follows the length prefix
fn has_zlib_header(raw: &[u8]) -> bool {
    match raw.get(LENGTH_PREFIX..LENGTH_PREFIX + 2) {
        Some(&[cmf, flg]) => {
            cmf & 0x0f == 8 && cmf >> 4 <= 7 && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0
        }
        _ => false,
    }
}

fn inflate(raw: &[u8]) -> Result<Vec<u8>> {
    let (prefix, stream) = raw.split_at(LENGTH_PREFIX);
    let declared = u64::from(u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]));

    // One byte past the declared length is enough to detect an overrun
    let mut out = Vec::new();
    ZlibDecoder::new(stream)
        .take(declared + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::CorruptPayload(format!("inflate failed: {}", e)))?;

    if out.len() as u64 != declared {
        return Err(Error::CorruptPayload(format!(
            "declared {} bytes but inflated {}",
            declared,
            out.len()
        )));
    }
    Ok(out)
}

/// Split an endpoint directive into (text before host, host, text after host)
fn split_endpoint(line: &str) -> Option<(&str, &str, &str)> {
    let key = line.rfind("Endpoint")?;
    let after_key = &line[key + "Endpoint".len()..];
    let value = after_key.trim_start().strip_prefix('=')?.trim_start();
    let host_start = line.len() - value.len();

    let host_len = value
        .find(|c: char| c == ':' || c.is_whitespace())
        .unwrap_or(value.len());
    let (host, rest) = value.split_at(host_len);
    let port = rest.strip_prefix(':')?;
    if host.is_empty() || !port.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }

    Some((&line[..host_start], host, rest))
}

/// Replace hostnames in `Endpoint = host:port` lines with resolved addresses
///
/// Literal IPs and bracketed IPv6 endpoints are left alone. A host that
/// `resolve` cannot map is an error.
pub fn resolve_endpoints<F>(text: &str, resolve: F) -> Result<String>
where
    F: Fn(&str) -> Option<IpAddr>,
{
    let mut out = String::with_capacity(text.len());

    for line in text.split_inclusive('\n') {
        let Some((head, host, rest)) = split_endpoint(line) else {
            out.push_str(line);
            continue;
        };

        if host.starts_with('[') || host.parse::<IpAddr>().is_ok() {
            out.push_str(line);
            continue;
        }

        let ip = resolve(host).ok_or_else(|| Error::ResolutionFailed(host.to_string()))?;
        log::info!("Resolved endpoint {} to {}", host, ip);
        out.push_str(head);
        out.push_str(&ip.to_string());
        out.push_str(rest);
    }

    Ok(out)
}

/// Resolve through the system resolver, preferring an IPv4 address
pub fn system_resolver(host: &str) -> Option<IpAddr> {
    let addrs: Vec<SocketAddr> = match (host, 0).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            log::warn!("Lookup of {} failed: {}", host, e);
            return None;
        }
    };

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(SocketAddr::ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const SAMPLE: &str = "[Interface]\nPrivateKey = abc\nAddress = 10.8.0.2/32\n\n[Peer]\nEndpoint = 203.0.113.7:51820\n";

    // Produced by the reference compressor
    const SAMPLE_LINK: &str = "vpn://AAAAWHjai_bMK0ktSktMTo3lCijKLEssSfVOrVSwVUhMSuZyTEkpSi0uBvIMDfQs9Az0jPSNjbi4ogNSU4tiuVzzUgryM_NKgNJGBsZAWUNDYz1zK1NDCyMDLgDL0hjg";

    fn fixed(ip: [u8; 4]) -> impl Fn(&str) -> Option<IpAddr> {
        move |_| Some(IpAddr::V4(Ipv4Addr::from(ip)))
    }

    #[test]
    fn test_roundtrip() {
        let link = encode(SAMPLE).unwrap();
        assert!(link.starts_with(SCHEME));
        let body = &link[SCHEME.len()..];
        assert!(!body.contains(['=', '+', '/']));
        assert_eq!(decode(&link).unwrap(), SAMPLE);
    }

    #[test]
    fn test_roundtrip_unicode_and_empty() {
        let text = "# Пир ünïcode\n[Peer]\n";
        assert_eq!(decode(&encode(text).unwrap()).unwrap(), text);
        assert_eq!(decode(&encode("").unwrap()).unwrap(), "");
    }

    #[test]
    fn test_length_prefix_is_uncompressed_size() {
        let link = encode(SAMPLE).unwrap();
        let raw = URL_SAFE_NO_PAD.decode(&link[SCHEME.len()..]).unwrap();
        assert_eq!(&raw[..4], &(SAMPLE.len() as u32).to_be_bytes());
        assert!(has_zlib_header(&raw));
    }

    #[test]
    fn test_decode_reference_links() {
        assert_eq!(decode(SAMPLE_LINK).unwrap(), SAMPLE);
        assert_eq!(decode("vpn://AAAAAHjaAwAAAAAB").unwrap(), "");
    }

    #[test]
    fn test_decode_tolerates_padding_and_whitespace() {
        let padded = format!("  {}==\n", SAMPLE_LINK);
        assert_eq!(decode(&padded).unwrap(), SAMPLE);

        // Scheme is optional
        assert_eq!(decode(&SAMPLE_LINK[SCHEME.len()..]).unwrap(), SAMPLE);
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let mut raw = URL_SAFE_NO_PAD.decode(&SAMPLE_LINK[SCHEME.len()..]).unwrap();
        raw.truncate(raw.len() - 10);
        let link = format!("{}{}", SCHEME, URL_SAFE_NO_PAD.encode(&raw));
        assert!(matches!(decode(&link), Err(Error::CorruptPayload(_))));
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let raw = URL_SAFE_NO_PAD.decode(&SAMPLE_LINK[SCHEME.len()..]).unwrap();
        for declared in [10u32, 1000] {
            let mut tampered = raw.clone();
            tampered[..4].copy_from_slice(&declared.to_be_bytes());
            let link = format!("{}{}", SCHEME, URL_SAFE_NO_PAD.encode(&tampered));
            assert!(matches!(decode(&link), Err(Error::CorruptPayload(_))));
        }
    }

    #[test]
    fn test_plain_payload_fallback() {
        let link = format!("{}{}", SCHEME, URL_SAFE_NO_PAD.encode("[Interface]\nAddress = 10.8.0.2/32\n"));
        assert_eq!(decode(&link).unwrap(), "[Interface]\nAddress = 10.8.0.2/32\n");

        let short = format!("{}{}", SCHEME, URL_SAFE_NO_PAD.encode("hi"));
        assert_eq!(decode(&short).unwrap(), "hi");
    }

    #[test]
    fn test_invalid_base64_is_corrupt() {
        assert!(matches!(decode("vpn://not*base64"), Err(Error::CorruptPayload(_))));
    }

    #[test]
    fn test_resolve_hostname_endpoint() {
        let text = "[Peer]\nEndpoint = vpn.example.com:51820\nAllowedIPs = 0.0.0.0/0\n";
        let resolved = resolve_endpoints(text, fixed([203, 0, 113, 7])).unwrap();
        assert_eq!(
            resolved,
            "[Peer]\nEndpoint = 203.0.113.7:51820\nAllowedIPs = 0.0.0.0/0\n"
        );
    }

    #[test]
    fn test_resolve_keeps_spacing_and_trailer() {
        let text = "  Endpoint=host-a:443 # primary";
        let resolved = resolve_endpoints(text, fixed([192, 0, 2, 1])).unwrap();
        assert_eq!(resolved, "  Endpoint=192.0.2.1:443 # primary");
    }

    #[test]
    fn test_resolve_leaves_literals_untouched() {
        let text = "Endpoint = 198.51.100.1:51820\nEndpoint = [2001:db8::1]:51820\n";
        let resolved = resolve_endpoints(text, |_| panic!("no lookup expected")).unwrap();
        assert_eq!(resolved, text);
    }

    #[test]
    fn test_resolve_ignores_lines_without_port() {
        let text = "Endpoint = somewhere\nPublicKey = abc\n";
        assert_eq!(resolve_endpoints(text, |_| None).unwrap(), text);
    }

    #[test]
    fn test_resolution_failure_is_fatal() {
        let text = "Endpoint = does-not-exist.invalid:51820\n";
        let err = resolve_endpoints(text, |_| None).unwrap_err();
        assert!(matches!(err, Error::ResolutionFailed(host) if host == "does-not-exist.invalid"));
    }

    #[test]
    fn test_system_resolver_accepts_literal() {
        assert_eq!(
            system_resolver("127.0.0.1"),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
    }
}
