// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Fixed-width keys and the canonical key hasher.
//!
//! Every notion of "sameness" in the engine reduces to a 160-bit digest:
//! rule keys identify a rule invocation, content hashes identify file
//! contents. [`KeyHasher`] is the sponge every key builder feeds; values
//! are tagged by type so that adjacent fields can never collide by
//! concatenation.

use std::fmt;

use sha1::{Digest, Sha1};

/// Width of every key and content hash, in bytes.
pub const KEY_WIDTH: usize = 20;

/// Error parsing a key from its hex form.
#[derive(Debug, thiserror::Error)]
pub enum ParseKeyError {
    /// Wrong input length.
    #[error("key must be {width} hex characters, got {0}", width = KEY_WIDTH * 2)]
    Length(usize),

    /// Invalid hex digits.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// A fixed-width hash identifying a specific rule invocation.
///
/// Default, input-based, dep-file, and manifest keys are logically distinct
/// but share this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey([u8; KEY_WIDTH]);

impl RuleKey {
    pub fn from_bytes(bytes: [u8; KEY_WIDTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_WIDTH] {
        &self.0
    }

    /// Lowercase hex form, as persisted in build-info metadata.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form written by [`RuleKey::to_hex`].
    pub fn parse_hex(s: &str) -> Result<Self, ParseKeyError> {
        if s.len() != KEY_WIDTH * 2 {
            return Err(ParseKeyError::Length(s.len()));
        }
        let mut bytes = [0u8; KEY_WIDTH];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleKey({})", self.to_hex())
    }
}

/// Hash of a file's contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; KEY_WIDTH]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; KEY_WIDTH]) -> Self {
        Self(bytes)
    }

    /// Hash a complete in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut sponge = Sha1::new();
        sponge.update(data);
        Self(sponge.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_WIDTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse_hex(s: &str) -> Result<Self, ParseKeyError> {
        if s.len() != KEY_WIDTH * 2 {
            return Err(ParseKeyError::Length(s.len()));
        }
        let mut bytes = [0u8; KEY_WIDTH];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

// Type tags keep adjacent fields from colliding by concatenation.
const TAG_STR: u8 = 0x01;
const TAG_U64: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_KEY: u8 = 0x04;
const TAG_HASH: u8 = 0x05;
const TAG_LIST: u8 = 0x06;

/// The hash sponge all key builders feed.
///
/// The canonical serialization rules: primitives and strings are written
/// with a type tag and (for variable-width values) a length prefix; ordered
/// collections are written in order behind a count; unordered collections
/// must be sorted by the caller before feeding. The process-wide key seed
/// is folded in at construction so a fleet can invalidate every key at once.
pub struct KeyHasher {
    sponge: Sha1,
}

impl KeyHasher {
    pub fn new(seed: u64) -> Self {
        let mut hasher = Self {
            sponge: Sha1::new(),
        };
        hasher.put_u64(seed);
        hasher
    }

    pub fn put_str(&mut self, s: &str) {
        self.sponge.update([TAG_STR]);
        self.sponge.update((s.len() as u32).to_be_bytes());
        self.sponge.update(s.as_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.sponge.update([TAG_U64]);
        self.sponge.update(v.to_be_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.sponge.update([TAG_BOOL, u8::from(v)]);
    }

    pub fn put_key(&mut self, key: &RuleKey) {
        self.sponge.update([TAG_KEY]);
        self.sponge.update(key.as_bytes());
    }

    pub fn put_content_hash(&mut self, hash: &ContentHash) {
        self.sponge.update([TAG_HASH]);
        self.sponge.update(hash.as_bytes());
    }

    /// Announce a collection of `len` elements; the elements follow.
    pub fn put_count(&mut self, len: usize) {
        self.sponge.update([TAG_LIST]);
        self.sponge.update((len as u32).to_be_bytes());
    }

    pub fn finish(self) -> RuleKey {
        RuleKey(self.sponge.finalize().into())
    }
}

#[cfg(test)]
#[path = "key_tests.rs"]
mod tests;
