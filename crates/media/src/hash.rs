//! Content digests and the hash encodings used by the content-hosting
//! system.
//!
//! Files are content-addressed by sha256 on the backup side, while the
//! source system records sha1 (base 36 in its own tables, hexadecimal
//! everywhere here) and the object store reports md5.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, Result};

/// Width of a zero-filled base 36 sha1, as stored by MediaWiki.
const SHA1_BASE36_LEN: usize = 31;
const SHA1_HEX_LEN: usize = 40;

/// All three digests of one byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digests {
    pub sha1: String,
    pub sha256: String,
    pub md5: String,
}
impl Digests {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = ContentHasher::default();
        hasher.update(data);
        hasher.finalize()
    }

    /// Compare against recorded digests; absent records are not checked.
    pub fn check(&self, sha1: Option<&str>, md5: Option<&str>) -> Option<DigestMismatch> {
        [("sha1", sha1, &self.sha1), ("md5", md5, &self.md5)].into_iter().find_map(
            |(algorithm, expected, actual)| match expected {
                Some(expected) if !expected.eq_ignore_ascii_case(actual) => Some(DigestMismatch {
                    algorithm,
                    expected: expected.to_string(),
                    actual: actual.clone(),
                }),
                _ => None,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMismatch {
    pub algorithm: &'static str,
    pub expected: String,
    pub actual: String,
}

/// Single-pass hasher computing every digest the engine records.
#[derive(Default, Clone)]
pub struct ContentHasher {
    sha1: Sha1,
    sha256: Sha256,
    md5: Md5,
}
impl ContentHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.md5.update(chunk);
    }

    pub fn finalize(self) -> Digests {
        Digests {
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
            md5: hex::encode(self.md5.finalize()),
        }
    }
}

/// Ensure `value` is a lowercase hexadecimal digest of the right length for
/// `algorithm` (`sha1`, `sha256` or `md5`).
pub fn validate_hex(algorithm: &'static str, value: &str) -> Result<()> {
    let expected = match algorithm {
        "sha1" => SHA1_HEX_LEN,
        "sha256" => 64,
        "md5" => 32,
        _ => 0,
    };
    let valid = value.len() == expected && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !valid {
        exn::bail!(ErrorKind::InvalidDigest {
            algorithm,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Convert a base 36 sha1 into zero-filled lowercase hexadecimal.
pub fn sha1_base36_to_hex(value: &str) -> Result<String> {
    rebase(&value.to_ascii_lowercase(), 36, 16, SHA1_HEX_LEN).ok_or_else(|| {
        exn::Exn::from(ErrorKind::InvalidDigest {
            algorithm: "sha1 (base 36)",
            value: value.to_string(),
        })
    })
}

/// Convert a hexadecimal sha1 into the zero-filled base 36 form.
pub fn sha1_hex_to_base36(value: &str) -> Result<String> {
    rebase(&value.to_ascii_lowercase(), 16, 36, SHA1_BASE36_LEN).ok_or_else(|| {
        exn::Exn::from(ErrorKind::InvalidDigest {
            algorithm: "sha1",
            value: value.to_string(),
        })
    })
}

/// Arbitrary-precision base conversion by repeated division over the digit
/// vector. Returns `None` for invalid digits or results wider than `width`.
fn rebase(input: &str, from: u32, to: u32, width: usize) -> Option<String> {
    let mut digits = input.chars().map(|c| c.to_digit(from)).collect::<Option<Vec<u32>>>()?;
    if digits.is_empty() {
        return None;
    }
    let mut output = Vec::new();
    while !digits.is_empty() {
        let mut remainder = 0;
        let mut quotient = Vec::with_capacity(digits.len());
        for digit in &digits {
            let accumulator = remainder * from + digit;
            let q = accumulator / to;
            remainder = accumulator % to;
            if !quotient.is_empty() || q != 0 {
                quotient.push(q);
            }
        }
        output.push(char::from_digit(remainder, to)?);
        digits = quotient;
    }
    if output.len() > width {
        return None;
    }
    let converted: String = output.iter().rev().collect();
    Some(format!("{converted:0>width$}"))
}
