//! Key identifiers, content keys and the key table used for decryption.
//!
//! Keys are parsed from License messages and unwrapped using AES-128-CBC.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use uuid::Uuid;

use crate::error::{Error, LicenseError, Result};
use crate::license_protocol::license::key_container::KeyType;
use crate::license_protocol::license::KeyContainer;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Length in bytes of a key id and of an AES-128 content key.
pub const KEY_LEN: usize = 16;

/// A 16-byte key identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Uuid);

impl KeyId {
    /// The all-zero key id.
    pub const NIL: KeyId = KeyId(Uuid::nil());

    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert a key id taken from a license or PSSH into a 16-byte id.
    ///
    /// Handles various formats:
    /// - 16 bytes: used directly
    /// - 32 bytes: hex-encoded UUID string
    /// - Decimal ASCII bytes: parsed as integer
    /// - Other lengths: right-padded with zeros or truncated to the first 16 bytes
    #[must_use]
    pub fn from_wire(kid: &[u8]) -> Self {
        if kid.is_empty() {
            return Self::NIL;
        }

        if let Ok(bytes) = <[u8; KEY_LEN]>::try_from(kid) {
            return Self::from_bytes(bytes);
        }

        if let Ok(s) = std::str::from_utf8(kid) {
            if s.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = s.parse::<u128>() {
                    return Self(Uuid::from_u128(n));
                }
            }
            if kid.len() == 32 {
                if let Ok(uuid) = Uuid::parse_str(s) {
                    return Self(uuid);
                }
            }
        }

        let mut buf = [0u8; KEY_LEN];
        let len = kid.len().min(KEY_LEN);
        buf[..len].copy_from_slice(&kid[..len]);
        Self::from_bytes(buf)
    }
}

impl From<Uuid> for KeyId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

impl FromStr for KeyId {
    type Err = Error;

    /// Parse a key id from hex, with or without dashes or a `0x` prefix.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|e| Error::MalformedHeader(format!("Invalid key id {:?}: {}", s, e)))
    }
}

/// A raw AES-128 content key.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    #[must_use]
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse a manually supplied key: exactly 32 hexadecimal characters.
    pub fn from_hex(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.len() != KEY_LEN * 2 {
            return Err(Error::Config(
                "Decryption key must be exactly 32 hex characters".to_string(),
            ));
        }
        let bytes = hex::decode(value)
            .map_err(|e| Error::Config(format!("Invalid decryption key: {}", e)))?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

impl TryFrom<&[u8]> for ContentKey {
    type Error = LicenseError;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        <[u8; KEY_LEN]>::try_from(value)
            .map(Self)
            .map_err(|_| {
                LicenseError::Unwrap(format!(
                    "Content key must be {} bytes, got {}",
                    KEY_LEN,
                    value.len()
                ))
            })
    }
}

/// A key unwrapped from a license key container.
///
/// Key type names use the license protocol enum string values (e.g. CONTENT).
#[derive(Debug, Clone)]
pub struct Key {
    /// Key type (e.g., CONTENT, SIGNING, etc.).
    pub key_type: KeyType,
    /// Key ID.
    pub kid: KeyId,
    /// Unwrapped key bytes.
    pub key: Vec<u8>,
}

impl Key {
    /// Unwrap a Key from a KeyContainer using the derived encryption key.
    pub fn from_key_container(
        container: &KeyContainer,
        enc_key: &[u8],
    ) -> std::result::Result<Self, LicenseError> {
        let key_type = container
            .r#type
            .and_then(|v| KeyType::try_from(v).ok())
            .ok_or_else(|| LicenseError::InvalidMessage("Missing key type".to_string()))?;

        let kid = KeyId::from_wire(container.id.as_deref().unwrap_or_default());

        let key_bytes = container
            .key
            .as_ref()
            .ok_or_else(|| LicenseError::InvalidMessage("Missing key bytes".to_string()))?;
        let iv_bytes = container
            .iv
            .as_ref()
            .ok_or_else(|| LicenseError::InvalidMessage("Missing IV bytes".to_string()))?;

        let key = unwrap_key(key_bytes, iv_bytes, enc_key)?;

        Ok(Self { key_type, kid, key })
    }

    #[must_use]
    pub fn is_content(&self) -> bool {
        self.key_type == KeyType::Content
    }
}

/// Decrypt a wrapped key using AES-128-CBC with PKCS#7 padding.
fn unwrap_key(
    encrypted_key: &[u8],
    iv: &[u8],
    enc_key: &[u8],
) -> std::result::Result<Vec<u8>, LicenseError> {
    let enc_key: [u8; KEY_LEN] = enc_key.try_into().map_err(|_| {
        LicenseError::Unwrap(format!(
            "Invalid encryption key length: expected 16, got {}",
            enc_key.len()
        ))
    })?;
    let iv: [u8; KEY_LEN] = iv.try_into().map_err(|_| {
        LicenseError::Unwrap(format!("Invalid IV length: expected 16, got {}", iv.len()))
    })?;

    let mut buffer = encrypted_key.to_vec();
    let decrypted = Aes128CbcDec::new(&enc_key.into(), &iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| LicenseError::Unwrap(format!("Failed to decrypt key: {}", e)))?;

    Ok(decrypted.to_vec())
}

/// Immutable mapping from key id to content key.
///
/// This is the single source of truth for the segment decryptor. It is either
/// built from a license (CONTENT keys only) or from a manually supplied key.
#[derive(Debug, Clone, Default)]
pub struct ContentKeyTable {
    keys: HashMap<KeyId, ContentKey>,
    unbound: Option<ContentKey>,
}

impl ContentKeyTable {
    /// Build a table from unwrapped license keys.
    ///
    /// Only CONTENT keys are kept. A key id may appear once per key type, so a
    /// signing key and a content key can share one.
    pub fn from_license_keys(keys: &[Key]) -> std::result::Result<Self, LicenseError> {
        let mut seen = std::collections::HashSet::new();
        let mut table = HashMap::new();
        for key in keys {
            if !seen.insert((key.key_type, key.kid)) {
                return Err(LicenseError::DuplicateKeyId(key.kid));
            }
            if key.is_content() {
                table.insert(key.kid, ContentKey::try_from(key.key.as_slice())?);
            }
        }
        if table.is_empty() {
            return Err(LicenseError::NoContentKeys);
        }
        Ok(Self {
            keys: table,
            unbound: None,
        })
    }

    /// A single-entry table for a manually supplied key.
    #[must_use]
    pub fn single(kid: KeyId, key: ContentKey) -> Self {
        Self {
            keys: HashMap::from([(kid, key)]),
            unbound: None,
        }
    }

    /// A table whose only key answers every lookup.
    ///
    /// Only used when the caller explicitly accepts a manual key for a stream
    /// that declares no key id.
    #[must_use]
    pub fn unbound(key: ContentKey) -> Self {
        Self {
            keys: HashMap::new(),
            unbound: Some(key),
        }
    }

    #[must_use]
    pub fn get(&self, kid: &KeyId) -> Option<&ContentKey> {
        self.keys.get(kid).or(self.unbound.as_ref())
    }

    #[must_use]
    pub fn contains(&self, kid: &KeyId) -> bool {
        self.get(kid).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len() + usize::from(self.unbound.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over bound entries in key id order.
    pub fn iter(&self) -> impl Iterator<Item = (&KeyId, &ContentKey)> {
        let mut entries: Vec<_> = self.keys.iter().collect();
        entries.sort_by_key(|(kid, _)| **kid);
        entries.into_iter()
    }
}
