//! Protection header discovery.
//!
//! A stream declares its protection in one of several places: an
//! `#EXT-X-KEY` tag of an HLS playlist, a `pssh` box of an init or media
//! segment, or a bare PSSH box / init data handed over as bytes or base64.
//! [`parse`] accepts any of them and reports either no protection or one
//! Widevine [`ProtectionHeader`].
use base64::Engine;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fmp4::{self, TrackEncryption};
use crate::hls;
use crate::key::KeyId;
use crate::pssh::{parse_pssh_box, Pssh, WIDEVINE_SYSTEM_ID};

/// Widevine protection data of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionHeader {
    /// Always the Widevine system id.
    pub system_id: Uuid,
    /// Widevine init data (`WidevinePsshData`) sent to the license server.
    pub init_data: Vec<u8>,
    /// Key ids the init data declares, possibly none.
    pub key_ids: Vec<KeyId>,
    /// License server named by the stream, if any.
    pub license_url: Option<String>,
}

impl ProtectionHeader {
    /// Build a header from a Widevine PSSH.
    pub fn from_pssh(pssh: &Pssh) -> Result<Self> {
        if !pssh.is_widevine() {
            return Err(Error::MalformedHeader(format!(
                "Unrecognized system id {}",
                pssh.system_id
            )));
        }
        Ok(Self {
            system_id: WIDEVINE_SYSTEM_ID,
            init_data: pssh.init_data.clone(),
            key_ids: pssh.key_ids()?,
            license_url: None,
        })
    }

    /// Synthesize a header for a stream that only declares a key id.
    pub fn from_key_id(kid: KeyId) -> Result<Self> {
        Self::from_pssh(&Pssh::from_key_ids(&[kid])?)
    }

    #[must_use]
    pub fn first_key_id(&self) -> Option<KeyId> {
        self.key_ids.first().copied()
    }

    /// The header as a full PSSH box.
    pub fn to_pssh(&self) -> Result<Pssh> {
        Pssh::new(self.system_id, None, Some(self.init_data.clone()), 0, 0)
    }
}

/// Protection state of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protection {
    Unprotected,
    Protected(ProtectionHeader),
}

impl Protection {
    #[must_use]
    pub fn header(&self) -> Option<&ProtectionHeader> {
        match self {
            Protection::Unprotected => None,
            Protection::Protected(header) => Some(header),
        }
    }

    #[must_use]
    pub fn is_protected(&self) -> bool {
        matches!(self, Protection::Protected(_))
    }
}

/// Interpret `bytes` as a playlist, MP4 data, or bare PSSH / init data.
pub fn parse(bytes: &[u8]) -> Result<Protection> {
    if bytes.is_empty() {
        return Err(Error::MalformedHeader("Empty protection data".to_string()));
    }

    if let Some(text) = hls::as_playlist_text(bytes) {
        return hls::protection_from_key_tags(&hls::key_tags(text)?);
    }

    if fmp4::looks_like_mp4(bytes) {
        return from_mp4(bytes);
    }

    let pssh = match std::str::from_utf8(bytes)
        .ok()
        .map(str::trim)
        .and_then(|text| base64::engine::general_purpose::STANDARD.decode(text).ok())
    {
        Some(decoded) => Pssh::from_bytes_strict(&decoded)?,
        None => Pssh::from_bytes_strict(bytes)?,
    };
    Ok(Protection::Protected(ProtectionHeader::from_pssh(&pssh)?))
}

/// Find the protection of MP4 init or media segment bytes.
pub fn from_mp4(bytes: &[u8]) -> Result<Protection> {
    let boxes = fmp4::find_pssh_boxes(bytes)?;

    let mut foreign = Vec::new();
    for raw in &boxes {
        let pssh = parse_pssh_box(raw)?;
        if pssh.is_widevine() {
            return Ok(Protection::Protected(ProtectionHeader::from_pssh(&pssh)?));
        }
        foreign.push(pssh.system_id.to_string());
    }
    if !foreign.is_empty() {
        return Err(Error::MalformedHeader(format!(
            "Unrecognized system id(s): {}",
            foreign.join(", ")
        )));
    }

    match TrackEncryption::from_init(bytes)? {
        Some(track) if track.protected => {
            debug!("No pssh box; synthesizing header for KID {}", track.default_kid);
            Ok(Protection::Protected(ProtectionHeader::from_key_id(
                track.default_kid,
            )?))
        }
        _ => Ok(Protection::Unprotected),
    }
}
