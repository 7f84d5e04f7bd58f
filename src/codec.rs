//! Rendering of raw remote output for the wire

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("'{encoding}' codec can't decode {len} bytes of output")]
pub struct DecodeError {
    pub encoding: String,
    pub len: usize,
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode strictly with the named encoding, no fallback
pub fn decode_strict(bytes: &[u8], label: &str) -> Result<String, DecodeError> {
    let encoding = Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| DecodeError {
        encoding: label.to_string(),
        len: bytes.len(),
    })?;

    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
        .ok_or_else(|| DecodeError {
            encoding: encoding.name().to_string(),
            len: bytes.len(),
        })
}

/// Decode with the named encoding, falling back to charset detection
pub fn decode_with_fallback(bytes: &[u8], label: &str) -> Result<String, DecodeError> {
    match decode_strict(bytes, label) {
        Ok(text) => Ok(text),
        Err(first) => {
            let mut detector = EncodingDetector::new();
            detector.feed(bytes, true);
            let guessed = detector.guess(None, true);
            debug!(
                "Decoding as '{}' failed, detected '{}'",
                label,
                guessed.name()
            );
            guessed
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(|text| text.into_owned())
                .ok_or(first)
        }
    }
}

/// Base64 when no encoding was requested, decoded text otherwise
pub fn render(bytes: &[u8], encoding: Option<&str>) -> Result<String, DecodeError> {
    match encoding {
        Some(label) => decode_with_fallback(bytes, label),
        None => Ok(to_base64(bytes)),
    }
}
