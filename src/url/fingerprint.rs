// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use sha1::{Digest, Sha1};

use crate::model::request::Method;

/// `H(method || canonical_url || body)`, SHA-1 over the `:`-joined
/// concatenation. SHA-1 is chosen for deduplication, not security; the raw
/// 20-byte digest is the canonical in-memory representation (see
/// `SPEC_FULL.md` §4.1, §9) — hex is derived only at presentation
/// boundaries via `to_hex`.
pub fn fingerprint(method: Method, canonical_url: &str, body: Option<&[u8]>) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(canonical_url.as_bytes());
    hasher.update(b":");
    if let Some(body) = body {
        hasher.update(body);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Hex encoding for logging and filenames only; never used as a dedup key.
pub fn to_hex(fp: &[u8; 20]) -> String {
    let mut out = String::with_capacity(40);
    for byte in fp {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_for_same_inputs() {
        let a = fingerprint(Method::Get, "http://example.com/a?x=1", None);
        let b = fingerprint(Method::Get, "http://example.com/a?x=1", None);
        assert_eq!(a, b);
    }

    #[test]
    fn differs_by_method() {
        let a = fingerprint(Method::Get, "http://example.com/a", None);
        let b = fingerprint(Method::Post, "http://example.com/a", None);
        assert_ne!(a, b);
    }

    #[test]
    fn differs_by_body() {
        let a = fingerprint(Method::Post, "http://example.com/a", Some(b"x=1"));
        let b = fingerprint(Method::Post, "http://example.com/a", Some(b"x=2"));
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trips_length() {
        let fp = fingerprint(Method::Get, "http://example.com/a", None);
        assert_eq!(to_hex(&fp).len(), 40);
    }
}
