//! PSSH box parsing and construction.
//!
//! A PSSH box carries system-specific init data. For Widevine the init data
//! is a `WidevinePsshData` protobuf listing the key ids protecting a stream.
use std::str::FromStr;

use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use prost::Message;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key::KeyId;
use crate::license_protocol::WidevinePsshData;

/// Widevine system UUID.
pub const WIDEVINE_SYSTEM_ID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);
/// Widevine URN string, as used in HLS `KEYFORMAT` attributes.
pub const WIDEVINE_URN: &str = "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";

/// Parsed PSSH box or bare Widevine init data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pssh {
    pub version: u8,
    pub flags: u32,
    pub system_id: Uuid,
    key_ids: Vec<KeyId>,
    pub init_data: Vec<u8>,
}

impl Pssh {
    /// Parse from bytes in lenient mode (strict = false).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse_bytes(data, false)
    }

    /// Parse from bytes in strict mode.
    pub fn from_bytes_strict(data: &[u8]) -> Result<Self> {
        Self::parse_bytes(data, true)
    }

    /// Parse from base64 in lenient mode (strict = false).
    pub fn from_base64(data_b64: &str) -> Result<Self> {
        Self::parse_base64(data_b64, false)
    }

    /// Parse a PSSH box or init data from raw bytes.
    ///
    /// Strict mode supports full PSSH boxes and bare `WidevinePsshData`.
    /// Lenient mode additionally wraps unknown input as a v0 Widevine PSSH
    /// with init_data set to the provided bytes.
    pub fn parse_bytes(data: &[u8], strict: bool) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::MalformedHeader("Data must not be empty".to_string()));
        }

        if data.len() >= 8 && &data[4..8] == b"pssh" {
            return parse_pssh_box(data);
        }

        if let Ok(pssh) = parse_widevine_pssh_data(data) {
            return Ok(pssh);
        }

        if strict {
            return Err(Error::MalformedHeader(
                "Could not parse data as PSSH or Widevine PSSH Data".to_string(),
            ));
        }

        Pssh::new(WIDEVINE_SYSTEM_ID, None, Some(data.to_vec()), 0, 0)
    }

    /// Parse a PSSH box or init data from base64.
    ///
    /// See [`Pssh::parse_bytes`] for strict/lenient behavior.
    pub fn parse_base64(data_b64: &str, strict: bool) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD.decode(data_b64.trim())?;
        Self::parse_bytes(&data, strict)
    }

    /// Create a new PSSH box wrapper.
    ///
    /// Version 0 uses only init_data. Version 1 requires init_data or key_ids.
    pub fn new(
        system_id: Uuid,
        key_ids: Option<Vec<KeyId>>,
        init_data: Option<Vec<u8>>,
        version: u8,
        flags: u32,
    ) -> Result<Self> {
        if version != 0 && version != 1 {
            return Err(Error::MalformedHeader(format!(
                "Invalid version: {}",
                version
            )));
        }

        if version == 0 && key_ids.is_some() && init_data.is_some() {
            return Err(Error::MalformedHeader(
                "Version 0 PSSH boxes must use only init_data".to_string(),
            ));
        }

        if version == 1 && key_ids.is_none() && init_data.is_none() {
            return Err(Error::MalformedHeader(
                "Version 1 PSSH boxes must use init_data or key_ids".to_string(),
            ));
        }

        Ok(Self {
            version,
            flags,
            system_id,
            key_ids: key_ids.unwrap_or_default(),
            init_data: init_data.unwrap_or_default(),
        })
    }

    /// Build a v0 Widevine PSSH whose init data lists `key_ids`.
    pub fn from_key_ids(key_ids: &[KeyId]) -> Result<Self> {
        let pssh_data = WidevinePsshData {
            key_ids: key_ids.iter().map(|id| id.as_bytes().to_vec()).collect(),
            ..Default::default()
        };
        Self::new(WIDEVINE_SYSTEM_ID, None, Some(pssh_data.encode_to_vec()), 0, 0)
    }

    #[must_use]
    pub fn is_widevine(&self) -> bool {
        self.system_id == WIDEVINE_SYSTEM_ID
    }

    /// Serialize as a full PSSH box.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        build_pssh_box(self)
    }

    /// Serialize as a base64 PSSH box.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    /// Extract KIDs from the box or its init data.
    ///
    /// v1 boxes list KIDs in the box header; otherwise the Widevine init data
    /// is decoded.
    pub fn key_ids(&self) -> Result<Vec<KeyId>> {
        if self.version == 1 && !self.key_ids.is_empty() {
            return Ok(self.key_ids.clone());
        }

        if !self.is_widevine() {
            return Err(Error::MalformedHeader(format!(
                "Unsupported system ID {}",
                self.system_id
            )));
        }

        let pssh_data = WidevinePsshData::decode(self.init_data.as_slice()).map_err(|e| {
            Error::MalformedHeader(format!("Failed to parse WidevinePsshData: {}", e))
        })?;
        Ok(pssh_data.key_ids.iter().map(|k| KeyId::from_wire(k)).collect())
    }
}

impl FromStr for Pssh {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pssh::parse_base64(s, false)
    }
}

/// Parse one PSSH box starting at the beginning of `data`.
pub(crate) fn parse_pssh_box(data: &[u8]) -> Result<Pssh> {
    let truncated = |what: &str| Error::MalformedHeader(format!("Truncated PSSH box: {}", what));

    if data.len() < 8 {
        return Err(truncated("header"));
    }

    let mut offset = 0;
    let size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    if &data[offset..offset + 4] != b"pssh" {
        return Err(Error::MalformedHeader("Not a PSSH box".to_string()));
    }
    offset += 4;

    let actual_size = match size {
        0 => data.len(),
        1 => {
            if data.len() < 16 {
                return Err(truncated("large size"));
            }
            let large = BigEndian::read_u64(&data[offset..offset + 8]) as usize;
            offset += 8;
            large
        }
        size => size,
    };

    if actual_size > data.len() {
        return Err(truncated("size exceeds data length"));
    }
    let data = &data[..actual_size];

    if data.len() < offset + 4 + 16 {
        return Err(truncated("full box header"));
    }

    let version = data[offset];
    let flags = BigEndian::read_u24(&data[offset + 1..offset + 4]);
    offset += 4;

    let system_id = Uuid::from_slice(&data[offset..offset + 16])
        .map_err(|_| Error::MalformedHeader("Invalid system ID".to_string()))?;
    offset += 16;

    let mut key_ids = Vec::new();
    if version == 1 {
        if data.len() < offset + 4 {
            return Err(truncated("KID count"));
        }
        let kid_count = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        offset += 4;

        let required = kid_count
            .checked_mul(16)
            .and_then(|n| n.checked_add(offset))
            .filter(|&n| n <= data.len())
            .ok_or_else(|| truncated("KIDs"))?;
        for chunk in data[offset..required].chunks_exact(16) {
            let mut kid = [0u8; 16];
            kid.copy_from_slice(chunk);
            key_ids.push(KeyId::from_bytes(kid));
        }
        offset = required;
    }

    if data.len() < offset + 4 {
        return Err(truncated("init data length"));
    }
    let data_size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    if data.len() < offset + data_size {
        return Err(truncated("init data"));
    }
    let init_data = data[offset..offset + data_size].to_vec();

    Ok(Pssh {
        version,
        flags,
        system_id,
        key_ids,
        init_data,
    })
}

fn build_pssh_box(pssh: &Pssh) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(pssh.version);
    body.extend_from_slice(&pssh.flags.to_be_bytes()[1..]);
    body.extend_from_slice(pssh.system_id.as_bytes());

    if pssh.version == 1 {
        body.extend_from_slice(&(pssh.key_ids.len() as u32).to_be_bytes());
        for kid in pssh.key_ids.iter() {
            body.extend_from_slice(kid.as_bytes());
        }
    }

    body.extend_from_slice(&(pssh.init_data.len() as u32).to_be_bytes());
    body.extend_from_slice(&pssh.init_data);

    let size = (body.len() + 8) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.extend_from_slice(&body);
    out
}

fn parse_widevine_pssh_data(data: &[u8]) -> Result<Pssh> {
    let pssh_data = WidevinePsshData::decode(data)?;
    let encoded = pssh_data.encode_to_vec();
    if encoded != data {
        return Err(Error::MalformedHeader(
            "Partial WidevinePsshData parse".to_string(),
        ));
    }

    Pssh::new(WIDEVINE_SYSTEM_ID, None, Some(encoded), 0, 0)
}
