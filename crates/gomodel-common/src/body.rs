use std::io::Read;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on captured request/response bodies.
pub const MAX_CAPTURED_BODY_BYTES: usize = 1024 * 1024;

/// Output cap for decompressing captured response bodies (zip-bomb guard).
const MAX_DECOMPRESSED_BYTES: usize = 2 * 1024 * 1024;

/// A captured body is stored structured when it parses as JSON so document
/// stores keep it queryable, and as a string otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BodyValue {
    Json(Value),
    Text(String),
}

impl BodyValue {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => BodyValue::Json(value),
            Err(_) => BodyValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            BodyValue::Json(value) => Some(value),
            BodyValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedBody {
    pub value: BodyValue,
    pub truncated: bool,
}

impl CapturedBody {
    /// Capture at most `MAX_CAPTURED_BODY_BYTES`; anything longer sets the
    /// too-big flag and keeps the capped prefix.
    pub fn capture(bytes: &[u8]) -> Self {
        if bytes.len() > MAX_CAPTURED_BODY_BYTES {
            Self {
                value: BodyValue::from_bytes(&bytes[..MAX_CAPTURED_BODY_BYTES]),
                truncated: true,
            }
        } else {
            Self {
                value: BodyValue::from_bytes(bytes),
                truncated: false,
            }
        }
    }
}

/// Inflate a captured response body according to its `Content-Encoding`.
/// Unknown encodings return the input untouched; decompression failures fall
/// back to the raw bytes rather than losing the capture.
pub fn decompress_body(encoding: Option<&str>, bytes: &[u8]) -> Vec<u8> {
    let Some(encoding) = encoding else {
        return bytes.to_vec();
    };

    match encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" | "x-gzip" => read_capped(flate2::read::GzDecoder::new(bytes)),
        "deflate" => read_capped(flate2::read::ZlibDecoder::new(bytes)),
        "br" => read_capped(brotli::Decompressor::new(bytes, 4096)),
        "identity" | "" => Some(bytes.to_vec()),
        _ => Some(bytes.to_vec()),
    }
    .unwrap_or_else(|| bytes.to_vec())
}

fn read_capped<R: Read>(mut reader: R) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Some(out),
            Ok(n) => {
                if out.len() + n > MAX_DECOMPRESSED_BYTES {
                    out.extend_from_slice(&chunk[..MAX_DECOMPRESSED_BYTES - out.len()]);
                    return Some(out);
                }
                out.extend_from_slice(&chunk[..n]);
            }
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn json_bodies_stay_structured() {
        let captured = CapturedBody::capture(br#"{"model":"gpt-4","n":1}"#);
        assert!(!captured.truncated);
        let json = captured.value.as_json().unwrap();
        assert_eq!(json["model"], "gpt-4");
    }

    #[test]
    fn non_json_bodies_become_lossy_text() {
        let captured = CapturedBody::capture(&[b'h', b'i', 0xFF, 0xFE]);
        match captured.value {
            BodyValue::Text(text) => assert!(text.starts_with("hi")),
            BodyValue::Json(_) => panic!("expected text"),
        }
    }

    #[test]
    fn oversized_bodies_set_the_flag() {
        let big = vec![b'a'; MAX_CAPTURED_BODY_BYTES + 1];
        let captured = CapturedBody::capture(&big);
        assert!(captured.truncated);
        match captured.value {
            BodyValue::Text(text) => assert_eq!(text.len(), MAX_CAPTURED_BODY_BYTES),
            BodyValue::Json(_) => panic!("expected text"),
        }
    }

    #[test]
    fn gzip_round_trip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = encoder.finish().unwrap();

        let inflated = decompress_body(Some("gzip"), &compressed);
        assert_eq!(inflated, b"{\"ok\":true}");
    }

    #[test]
    fn unknown_encoding_passes_through() {
        let bytes = b"raw".to_vec();
        assert_eq!(decompress_body(Some("zstd"), &bytes), bytes);
        assert_eq!(decompress_body(None, &bytes), bytes);
    }
}
