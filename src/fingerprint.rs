//! Cache key derivation
//!
//! A cache key is `METHOD_<sanitized url>` with a SHA-256 digest of the
//! request body appended for methods that carry a payload. Keys double as
//! file names, so every character a file system may reject is mapped to
//! [`SUBSTITUTE`] instead of being dropped.
//!
//! Two URLs map onto the same key only when they differ solely in:
//! - which disallowed character (or a literal `-`) sits at a given position,
//! - a `://` scheme separator versus a literal `-` at the same position,
//! - trailing dots or spaces versus literal `-` characters at the end.

use sha2::{Digest, Sha256};

/// Replacement for characters a file name cannot hold
pub const SUBSTITUTE: char = '-';

/// Longest key (in bytes) written to disk as-is
pub const KEY_LEN_MAX: usize = 200;

/// Methods whose body has no defined semantics; their keys omit the digest
pub const BODYLESS_METHODS: [&str; 4] = ["GET", "HEAD", "OPTIONS", "TRACE"];

/// Check whether a method's body takes part in the cache key
#[must_use]
pub fn carries_payload(method: &str) -> bool {
    !BODYLESS_METHODS
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

/// Derive the cache key for a request
///
/// Pure: identical inputs always produce identical keys.
#[must_use]
pub fn cache_key(method: &str, canonical_url: &str, body: &[u8]) -> String {
    let method = method.to_uppercase();
    let mut key = format!(
        "{method}_{}",
        sanitize(&canonical_url.replacen("://", "-", 1))
    );
    let mut components = format!("{method}\n{canonical_url}");

    if carries_payload(&method) {
        let digest = body_digest(body);
        key.push(' ');
        key.push_str(&digest);
        components.push('\n');
        components.push_str(&digest);
    }

    bound_length(key, &components)
}

/// Hex SHA-256 digest of a request body
#[must_use]
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Map every character a file name cannot hold to [`SUBSTITUTE`]
///
/// The output always has the same number of characters as the input.
#[must_use]
pub fn sanitize(input: &str) -> String {
    let mut out: String = input
        .chars()
        .map(|c| if is_disallowed(c) { SUBSTITUTE } else { c })
        .collect();

    // Windows silently strips trailing dots and spaces
    let trailing = out
        .chars()
        .rev()
        .take_while(|c| *c == '.' || *c == ' ')
        .count();
    if trailing > 0 {
        let cut = out.len() - trailing;
        out.truncate(cut);
        out.extend(std::iter::repeat(SUBSTITUTE).take(trailing));
    }

    out
}

fn is_disallowed(c: char) -> bool {
    matches!(c, '/' | '\\' | '?' | '<' | '>' | ':' | '*' | '|' | '"') || c.is_control()
}

/// Cut overlong keys and tag them with a digest of every key component
///
/// The truncated part may hold the body digest, so the tag covers the
/// method, the unsanitized URL and the body digest.
fn bound_length(key: String, components: &str) -> String {
    if key.len() <= KEY_LEN_MAX {
        return key;
    }

    let tag = &body_digest(components.as_bytes())[..16];
    let mut cut = KEY_LEN_MAX - tag.len() - 1;
    while !key.is_char_boundary(cut) {
        cut -= 1;
    }

    format!("{}~{tag}", &key[..cut])
}
