//! HLS media playlists.
//!
//! Segments and the init map are read with `m3u8-rs`. Key tags are scanned
//! separately: a playlist may carry several `#EXT-X-KEY` lines for different
//! key systems, and the `KEYID` attribute is needed to pick the content key.
use regex::Regex;

use crate::error::{Error, Result};
use crate::key::KeyId;
use crate::protection::{Protection, ProtectionHeader};
use crate::pssh::{Pssh, WIDEVINE_URN};
use crate::utils::resolve_uri;

const ATTRIBUTE_PATTERN: &str = r#"([A-Z0-9-]+)=("[^"]*"|[^,]*)"#;

/// One `#EXT-X-KEY` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTag {
    pub method: String,
    pub uri: Option<String>,
    pub keyformat: Option<String>,
    pub key_id: Option<KeyId>,
}

impl KeyTag {
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.method.eq_ignore_ascii_case("NONE")
    }

    #[must_use]
    pub fn is_widevine(&self) -> bool {
        self.keyformat.as_deref().is_some_and(|format| {
            format.eq_ignore_ascii_case(WIDEVINE_URN) || format.eq_ignore_ascii_case("com.widevine")
        })
    }

    /// Base64 payload of a `data:` URI.
    fn data_payload(&self) -> Option<&str> {
        let uri = self.uri.as_deref()?;
        if !uri.starts_with("data:") {
            return None;
        }
        let (meta, payload) = uri.split_once(',')?;
        meta.ends_with(";base64").then_some(payload)
    }
}

/// Return the playlist text if `bytes` is an HLS playlist.
pub(crate) fn as_playlist_text(bytes: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(bytes).ok()?;
    let text = text.trim_start_matches('\u{feff}').trim_start();
    text.starts_with("#EXTM3U").then_some(text)
}

/// Collect every `#EXT-X-KEY` tag of a playlist, in order.
pub fn key_tags(text: &str) -> Result<Vec<KeyTag>> {
    let attribute = Regex::new(ATTRIBUTE_PATTERN)
        .map_err(|e| Error::Manifest(format!("Invalid attribute pattern: {}", e)))?;

    let mut tags = Vec::new();
    for line in text.lines() {
        let Some(attributes) = line.trim().strip_prefix("#EXT-X-KEY:") else {
            continue;
        };

        let mut tag = KeyTag {
            method: String::new(),
            uri: None,
            keyformat: None,
            key_id: None,
        };
        for caps in attribute.captures_iter(attributes) {
            let value = caps[2].trim_matches('"').to_string();
            match &caps[1] {
                "METHOD" => tag.method = value,
                "URI" => tag.uri = Some(value),
                "KEYFORMAT" => tag.keyformat = Some(value),
                "KEYID" => tag.key_id = Some(parse_key_id(&value)?),
                _ => {}
            }
        }
        tags.push(tag);
    }
    Ok(tags)
}

fn parse_key_id(value: &str) -> Result<KeyId> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes: [u8; 16] = hex::decode(digits)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::MalformedHeader(format!("Invalid KEYID {}", value)))?;
    Ok(KeyId::from_bytes(bytes))
}

/// The first `KEYID` declared by any key tag.
#[must_use]
pub fn declared_key_id(tags: &[KeyTag]) -> Option<KeyId> {
    tags.iter().find_map(|tag| tag.key_id)
}

/// Decide the protection of a playlist from its key tags.
pub fn protection_from_key_tags(tags: &[KeyTag]) -> Result<Protection> {
    if tags.iter().all(KeyTag::is_none) {
        return Ok(Protection::Unprotected);
    }

    let Some(tag) = tags.iter().find(|tag| !tag.is_none() && tag.is_widevine()) else {
        let formats = tags
            .iter()
            .filter(|tag| !tag.is_none())
            .map(|tag| tag.keyformat.as_deref().unwrap_or("identity"))
            .collect::<Vec<_>>();
        return Err(Error::MalformedHeader(format!(
            "No Widevine key tag (found: {})",
            formats.join(", ")
        )));
    };

    let payload = tag
        .data_payload()
        .ok_or_else(|| Error::MalformedHeader("Widevine key URI is not a base64 data URI".to_string()))?;
    let pssh = Pssh::parse_base64(payload, true)?;
    let mut header = ProtectionHeader::from_pssh(&pssh)?;
    if header.key_ids.is_empty() {
        if let Some(kid) = tag.key_id.or_else(|| declared_key_id(tags)) {
            header.key_ids.push(kid);
        }
    }
    Ok(Protection::Protected(header))
}

/// A resolved HLS media playlist.
#[derive(Debug, Clone)]
pub struct MediaManifest {
    /// URL the playlist was loaded from.
    pub url: String,
    /// Absolute URL of the `EXT-X-MAP` init segment.
    pub init_uri: String,
    /// Absolute media segment URLs, in playback order.
    pub segment_uris: Vec<String>,
    pub keys: Vec<KeyTag>,
}

impl MediaManifest {
    /// Parse a media playlist, resolving URIs against `url`.
    ///
    /// Master playlists are rejected; the caller must pick a variant.
    pub fn parse(data: &[u8], url: &str) -> Result<Self> {
        let text = as_playlist_text(data)
            .ok_or_else(|| Error::Manifest("Not an HLS playlist".to_string()))?;

        let playlist = match m3u8_rs::parse_playlist_res(text.as_bytes()) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => playlist,
            Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
                return Err(Error::Manifest(
                    "Master playlists are not supported; pass a media playlist".to_string(),
                ))
            }
            Err(e) => return Err(Error::Manifest(format!("Failed to parse playlist: {:?}", e))),
        };

        let init_uri = playlist
            .segments
            .iter()
            .find_map(|segment| segment.map.as_ref())
            .map(|map| resolve_uri(url, &map.uri))
            .transpose()?
            .ok_or_else(|| Error::Manifest("Playlist has no EXT-X-MAP init segment".to_string()))?;

        let segment_uris = playlist
            .segments
            .iter()
            .map(|segment| resolve_uri(url, &segment.uri))
            .collect::<Result<Vec<_>>>()?;
        if segment_uris.is_empty() {
            return Err(Error::Manifest("No media segments found in playlist".to_string()));
        }

        debug!("Playlist {}: {} segments", url, segment_uris.len());
        Ok(Self {
            url: url.to_string(),
            init_uri,
            segment_uris,
            keys: key_tags(text)?,
        })
    }

    /// Protection declared by the key tags.
    pub fn protection(&self) -> Result<Protection> {
        protection_from_key_tags(&self.keys)
    }

    #[must_use]
    pub fn declared_key_id(&self) -> Option<KeyId> {
        declared_key_id(&self.keys)
    }
}
