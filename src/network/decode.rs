//! Response body decoding

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use crate::{ApiCacheError, Result};

/// Decode a fully buffered response body into text
///
/// `gzip` and `deflate` are inflated, an absent or `identity` encoding
/// passes through. Invalid UTF-8 is replaced, never rejected.
///
/// # Errors
///
/// Returns [`ApiCacheError::Decode`] for corrupt data or an unsupported encoding
pub fn decode_body(content_encoding: Option<&str>, body: &[u8]) -> Result<String> {
    let encoding = content_encoding
        .map(|e| e.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if body.is_empty() {
        return Ok(String::new());
    }

    let bytes = match encoding.as_str() {
        "" | "identity" => return Ok(String::from_utf8_lossy(body).into_owned()),
        "gzip" | "x-gzip" => inflate(GzDecoder::new(body), "gzip")?,
        "deflate" => inflate(ZlibDecoder::new(body), "deflate")
            .or_else(|_| inflate(DeflateDecoder::new(body), "deflate"))?,
        other => {
            return Err(ApiCacheError::Decode(format!(
                "unsupported content-encoding '{other}'"
            )))
        }
    };

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn inflate(mut decoder: impl Read, encoding: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ApiCacheError::Decode(format!("corrupt {encoding} body: {e}")))?;
    Ok(out)
}
