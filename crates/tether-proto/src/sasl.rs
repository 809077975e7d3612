//! SASL payload encoding for IRC registration.
//!
//! AUTHENTICATE carries base64 payloads in chunks of at most 400 bytes;
//! a payload whose length is a multiple of 400 (including the empty
//! payload) is terminated by a lone `+`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Maximum payload bytes per AUTHENTICATE line.
pub const AUTHENTICATE_CHUNK_LEN: usize = 400;

/// Encode PLAIN credentials: `authzid NUL authcid NUL password`.
///
/// IRC leaves the authorization identity empty.
pub fn encode_plain(username: &str, password: &str) -> String {
    let payload = format!("\0{username}\0{password}");
    BASE64.encode(payload.as_bytes())
}

/// Split an encoded payload into AUTHENTICATE parameters.
///
/// Always yields at least one element; an empty payload yields `["+"]`.
pub fn authenticate_chunks(encoded: &str) -> Vec<String> {
    if encoded.is_empty() {
        return vec!["+".to_string()];
    }

    let bytes = encoded.as_bytes();
    let mut chunks: Vec<String> = bytes
        .chunks(AUTHENTICATE_CHUNK_LEN)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    if bytes.len() % AUTHENTICATE_CHUNK_LEN == 0 {
        chunks.push("+".to_string());
    }
    chunks
}

/// Decode the payload of one inbound AUTHENTICATE parameter.
///
/// Returns `None` on invalid base64. A lone `+` decodes to empty.
pub fn decode_payload(param: &str) -> Option<Vec<u8>> {
    if param == "+" {
        return Some(Vec::new());
    }
    BASE64.decode(param).ok()
}

/// Split a decoded PLAIN payload into (authzid, authcid, password).
pub fn split_plain(payload: &[u8]) -> Option<(String, String, String)> {
    let mut parts = payload.split(|&b| b == 0);
    let authzid = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let authcid = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let password = String::from_utf8(parts.next()?.to_vec()).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((authzid, authcid, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_roundtrip() {
        let encoded = encode_plain("user", "pass");
        let decoded = decode_payload(&encoded).unwrap();
        assert_eq!(decoded, b"\0user\0pass");
        let (authzid, authcid, password) = split_plain(&decoded).unwrap();
        assert_eq!(authzid, "");
        assert_eq!(authcid, "user");
        assert_eq!(password, "pass");
    }

    #[test]
    fn short_payload_single_chunk() {
        let chunks = authenticate_chunks("YWJj");
        assert_eq!(chunks, vec!["YWJj"]);
    }

    #[test]
    fn exact_multiple_gets_plus_terminator() {
        let payload = "a".repeat(AUTHENTICATE_CHUNK_LEN);
        let chunks = authenticate_chunks(&payload);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), AUTHENTICATE_CHUNK_LEN);
        assert_eq!(chunks[1], "+");
    }

    #[test]
    fn long_payload_split() {
        let payload = "a".repeat(AUTHENTICATE_CHUNK_LEN + 10);
        let chunks = authenticate_chunks(&payload);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 10);
    }

    #[test]
    fn empty_payload_is_plus() {
        assert_eq!(authenticate_chunks(""), vec!["+"]);
        assert_eq!(decode_payload("+").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn split_plain_rejects_extra_fields() {
        assert!(split_plain(b"\0a\0b\0c").is_none());
        assert!(split_plain(b"\0a").is_none());
    }
}
