//! Magnet URI parsing.
//!
//! Format: `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>`. The hash may be
//! 40 hex characters or 32 base32 characters; both normalise to lowercase hex.

use tethys_torrent_core::{ContentHash, SourceDescriptor, TorrentError, TorrentResult};
use url::Url;

const BTIH_PREFIX: &str = "urn:btih:";
const BASE32_HASH_LEN: usize = 32;

/// Parse a magnet URI into the identity and hints it carries.
///
/// # Errors
///
/// Returns [`TorrentError::InvalidSource`] when the URI is not a magnet link or
/// lacks a usable `xt` parameter.
pub fn parse_magnet(source_uri: &str) -> TorrentResult<SourceDescriptor> {
    let invalid = |reason: &'static str| TorrentError::InvalidSource {
        source_uri: source_uri.to_string(),
        reason,
    };

    let trimmed = source_uri.trim();
    let url = Url::parse(trimmed).map_err(|_| invalid("source is not a valid uri"))?;
    if url.scheme() != "magnet" {
        return Err(invalid("only magnet uris are supported"));
    }

    let mut content_hash = None;
    let mut display_name = None;
    let mut trackers = Vec::new();
    for (key, value) in url.query_pairs() {
        match &*key {
            "xt" if content_hash.is_none() => content_hash = parse_btih(&value),
            "dn" if display_name.is_none() && !value.trim().is_empty() => {
                display_name = Some(value.trim().to_string());
            }
            "tr" if !value.is_empty() && !trackers.iter().any(|t| *t == *value) => {
                trackers.push(value.into_owned());
            }
            _ => {}
        }
    }

    let content_hash = content_hash.ok_or_else(|| invalid("missing or malformed btih topic"))?;
    Ok(SourceDescriptor {
        content_hash,
        display_name,
        trackers,
    })
}

fn parse_btih(topic: &str) -> Option<ContentHash> {
    let prefix = topic.get(..BTIH_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(BTIH_PREFIX) {
        return None;
    }
    let digest = &topic[BTIH_PREFIX.len()..];
    match digest.len() {
        ContentHash::HEX_LEN => ContentHash::from_hex(digest),
        BASE32_HASH_LEN => base32_decode(digest).map(|bytes| ContentHash::from_bytes(&bytes)),
        _ => None,
    }
}

/// RFC 4648 base32 decoding of a 20-byte digest, case-insensitive.
fn base32_decode(input: &str) -> Option<[u8; 20]> {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut output = [0_u8; 20];
    let mut buffer: u64 = 0;
    let mut bits = 0_u32;
    let mut written = 0_usize;

    for byte in input.bytes() {
        let upper = byte.to_ascii_uppercase();
        let value = ALPHABET.iter().position(|&candidate| candidate == upper)?;
        buffer = (buffer << 5) | u64::try_from(value).ok()?;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            *output.get_mut(written)? = u8::try_from((buffer >> bits) & 0xff).ok()?;
            written += 1;
        }
    }

    (written == output.len()).then_some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn parses_hex_magnet_with_name_and_trackers() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=Big+Buck%20Bunny&tr=udp%3A%2F%2Ftracker.example%3A80&tr=udp%3A%2F%2Ftracker.example%3A80&tr=http%3A%2F%2Fother.example%2Fannounce",
            HEX.to_uppercase()
        );
        let parsed = parse_magnet(&uri).expect("valid magnet");
        assert_eq!(parsed.content_hash.as_str(), HEX);
        assert_eq!(parsed.display_name.as_deref(), Some("Big Buck Bunny"));
        assert_eq!(
            parsed.trackers,
            vec![
                "udp://tracker.example:80".to_string(),
                "http://other.example/announce".to_string()
            ]
        );
    }

    #[test]
    fn parses_base32_topic() {
        // base32 of twenty 0xff bytes
        let uri = "magnet:?xt=urn:btih:77777777777777777777777777777777";
        let parsed = parse_magnet(uri).expect("valid magnet");
        assert_eq!(parsed.content_hash.as_str(), "ff".repeat(20));
        assert!(parsed.display_name.is_none());
    }

    #[test]
    fn rejects_non_magnet_and_missing_topic() {
        for uri in [
            "",
            "not a uri",
            "http://example.com/file.torrent",
            "magnet:?dn=nothing",
            "magnet:?xt=urn:btih:abc",
            "magnet:?xt=urn:sha1:c12fe1c06bba254a9dc9f519b335aa7c1367a88a",
        ] {
            let err = parse_magnet(uri).expect_err("should reject");
            assert!(matches!(err, TorrentError::InvalidSource { .. }), "{uri}");
        }
    }

    #[test]
    fn base32_rejects_bad_alphabet() {
        assert!(base32_decode("0000000000000000000000000000000!").is_none());
        assert!(base32_decode("AAAA").is_none());
    }
}
