//! CENC (`cenc`, AES-128-CTR) segment decryption.
//!
//! A segment is one protected sample: its bytes, the IV and the map of clear
//! and encrypted ranges. Encrypted ranges of one segment share a single
//! running keystream, so a subsample that ends mid-block continues the block
//! in the next encrypted range.
use std::collections::HashMap;

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::DecryptionError;
use crate::key::{ContentKey, ContentKeyTable, KeyId};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Result<T> = std::result::Result<T, DecryptionError>;

/// How the CTR counter evolves between segments of a track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterPolicy {
    /// Restart from each segment's own IV.
    #[default]
    PerSegment,
    /// Continue the keystream across segments; the first IV seeds it.
    Continuous,
}

/// A contiguous byte range of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRange {
    pub offset: usize,
    pub length: usize,
    pub encrypted: bool,
}

impl SampleRange {
    #[must_use]
    pub const fn encrypted(offset: usize, length: usize) -> Self {
        Self {
            offset,
            length,
            encrypted: true,
        }
    }

    #[must_use]
    pub const fn clear(offset: usize, length: usize) -> Self {
        Self {
            offset,
            length,
            encrypted: false,
        }
    }

    fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Encrypted bytes with the key id, IV and range map needed to decrypt them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSegment {
    pub key_id: KeyId,
    pub iv: [u8; 16],
    /// Ranges tiling `data` contiguously, in order.
    pub ranges: Vec<SampleRange>,
    pub data: Vec<u8>,
}

impl EncryptedSegment {
    /// A segment encrypted from its first to its last byte.
    #[must_use]
    pub fn fully_encrypted(key_id: KeyId, iv: [u8; 16], data: Vec<u8>) -> Self {
        let ranges = vec![SampleRange::encrypted(0, data.len())];
        Self {
            key_id,
            iv,
            ranges,
            data,
        }
    }

    fn validate(&self) -> Result<()> {
        let mut expected_offset = 0;
        for range in &self.ranges {
            if range.offset != expected_offset {
                return Err(DecryptionError::InvalidRanges(format!(
                    "range at {} does not follow previous range ending at {}",
                    range.offset, expected_offset
                )));
            }
            expected_offset = range.end();
        }
        if expected_offset != self.data.len() {
            return Err(DecryptionError::LengthMismatch {
                expected: self.data.len(),
                actual: expected_offset,
            });
        }
        Ok(())
    }
}

/// Plaintext of one range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedSample {
    pub offset: usize,
    pub data: Vec<u8>,
}

/// Decrypts segments against a key table.
///
/// With [`CounterPolicy::Continuous`] the decryptor remembers one keystream
/// per key id, so segments of a track must be fed in order.
pub struct SegmentDecryptor<'k> {
    keys: &'k ContentKeyTable,
    policy: CounterPolicy,
    streams: HashMap<KeyId, Aes128Ctr>,
}

impl std::fmt::Debug for SegmentDecryptor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentDecryptor")
            .field("policy", &self.policy)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl<'k> SegmentDecryptor<'k> {
    #[must_use]
    pub fn new(keys: &'k ContentKeyTable, policy: CounterPolicy) -> Self {
        Self {
            keys,
            policy,
            streams: HashMap::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> CounterPolicy {
        self.policy
    }

    /// Start decrypting `segment`.
    ///
    /// The key lookup and range validation happen here, before any output.
    /// The returned iterator yields one [`DecryptedSample`] per range.
    pub fn decrypt(&mut self, segment: EncryptedSegment) -> Result<DecryptedSamples<'_>> {
        segment.validate()?;
        let key = lookup(self.keys, &segment.key_id)?;

        let cipher = match self.policy {
            CounterPolicy::PerSegment => {
                self.streams.insert(segment.key_id, new_cipher(key, &segment.iv));
                self.streams.get_mut(&segment.key_id)
            }
            CounterPolicy::Continuous => Some(
                self.streams
                    .entry(segment.key_id)
                    .or_insert_with(|| new_cipher(key, &segment.iv)),
            ),
        }
        .ok_or(DecryptionError::MissingKey(segment.key_id))?;

        Ok(DecryptedSamples {
            cipher,
            segment,
            next: 0,
        })
    }

    /// Decrypt `segment` into one contiguous buffer.
    pub fn decrypt_to_vec(&mut self, segment: EncryptedSegment) -> Result<Vec<u8>> {
        let expected = segment.data.len();
        let plaintext: Vec<u8> = self.decrypt(segment)?.flat_map(|s| s.data).collect();
        if plaintext.len() != expected {
            return Err(DecryptionError::LengthMismatch {
                expected,
                actual: plaintext.len(),
            });
        }
        Ok(plaintext)
    }
}

/// Lazy, single-pass sequence of decrypted ranges of one segment.
pub struct DecryptedSamples<'a> {
    cipher: &'a mut Aes128Ctr,
    segment: EncryptedSegment,
    next: usize,
}

impl Iterator for DecryptedSamples<'_> {
    type Item = DecryptedSample;

    fn next(&mut self) -> Option<Self::Item> {
        let range = *self.segment.ranges.get(self.next)?;
        self.next += 1;

        let mut data = self.segment.data[range.offset..range.end()].to_vec();
        if range.encrypted {
            self.cipher.apply_keystream(&mut data);
        }
        Some(DecryptedSample {
            offset: range.offset,
            data,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.segment.ranges.len() - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for DecryptedSamples<'_> {}

/// Encrypt plaintext laid out like `segment` (CTR is its own inverse).
///
/// `segment.data` holds the plaintext; the result has the same length.
pub fn encrypt_segment(segment: &EncryptedSegment, key: &ContentKey) -> Result<Vec<u8>> {
    segment.validate()?;
    Ok(apply_ranges(key, segment))
}

/// Decrypt independent segments in parallel with per-segment counters.
///
/// The output follows input order.
pub fn decrypt_parallel(
    segments: &[EncryptedSegment],
    keys: &ContentKeyTable,
) -> Result<Vec<Vec<u8>>> {
    segments
        .par_iter()
        .map(|segment| -> Result<Vec<u8>> {
            segment.validate()?;
            let key = lookup(keys, &segment.key_id)?;
            Ok(apply_ranges(key, segment))
        })
        .collect()
}

fn lookup<'k>(keys: &'k ContentKeyTable, kid: &KeyId) -> Result<&'k ContentKey> {
    keys.get(kid).ok_or(DecryptionError::MissingKey(*kid))
}

fn new_cipher(key: &ContentKey, iv: &[u8; 16]) -> Aes128Ctr {
    Aes128Ctr::new(key.as_bytes().into(), iv.into())
}

fn apply_ranges(key: &ContentKey, segment: &EncryptedSegment) -> Vec<u8> {
    let mut cipher = new_cipher(key, &segment.iv);
    let mut out = segment.data.clone();
    for range in segment.ranges.iter().filter(|r| r.encrypted) {
        cipher.apply_keystream(&mut out[range.offset..range.end()]);
    }
    out
}
