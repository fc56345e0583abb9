//! Fragmented MP4 (CMAF) box walking and CENC sample extraction.
//!
//! Only what the download pipeline needs is parsed: `pssh` boxes, the track
//! encryption boxes of the init segment, and `moof`/`mdat` pairs of media
//! segments. Clearing a stream never changes box sizes: protection boxes are
//! renamed to `free` and the protected sample entry gets its original format
//! back, so every offset stays valid.
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::decrypt::{EncryptedSegment, SampleRange};
use crate::error::{DecryptionError, Error};
use crate::key::KeyId;

pub type FourCc = [u8; 4];

/// `cenc` protection scheme (AES-128-CTR).
pub const SCHEME_CENC: FourCc = *b"cenc";

const CONTAINERS: &[&FourCc] = &[
    b"moov", b"trak", b"mdia", b"minf", b"stbl", b"moof", b"traf", b"sinf", b"schi", b"mvex",
    b"edts", b"dinf", b"udta",
];
const AUDIO_ENTRIES: &[&FourCc] = &[b"enca", b"mp4a", b"ec-3", b"ac-3", b"alac", b"fLaC", b"Opus"];
const VISUAL_ENTRIES: &[&FourCc] = &[b"encv", b"avc1", b"hvc1", b"hev1"];
const FRAGMENT_PROTECTION_BOXES: &[&FourCc] = &[b"senc", b"saiz", b"saio", b"pssh"];

/// A box could not be read.
#[derive(Debug, Error)]
#[error("Invalid {box_type} box at offset {offset}: {reason}")]
pub struct BoxError {
    pub box_type: String,
    pub offset: usize,
    pub reason: String,
}

impl BoxError {
    fn new(box_type: &FourCc, offset: usize, reason: impl Into<String>) -> Self {
        Self {
            box_type: String::from_utf8_lossy(box_type).into_owned(),
            offset,
            reason: reason.into(),
        }
    }
}

impl From<BoxError> for Error {
    fn from(err: BoxError) -> Self {
        Error::MalformedHeader(err.to_string())
    }
}

impl From<BoxError> for DecryptionError {
    fn from(err: BoxError) -> Self {
        DecryptionError::Fragment(err.to_string())
    }
}

/// One box within a buffer. Offsets are absolute within the walked buffer.
#[derive(Debug, Clone, Copy)]
pub struct Mp4Box<'a> {
    pub box_type: FourCc,
    /// Offset of the box header.
    pub start: usize,
    /// Header length (8 or 16 bytes).
    pub header_len: usize,
    /// Box payload, after the header.
    pub payload: &'a [u8],
}

impl<'a> Mp4Box<'a> {
    #[must_use]
    pub fn size(&self) -> usize {
        self.header_len + self.payload.len()
    }

    #[must_use]
    pub fn payload_start(&self) -> usize {
        self.start + self.header_len
    }

    /// Iterate over child boxes starting `skip` bytes into the payload.
    #[must_use]
    pub fn children(&self, skip: usize) -> BoxIter<'a> {
        let skip = skip.min(self.payload.len());
        BoxIter::with_base(&self.payload[skip..], self.payload_start() + skip)
    }

    /// Split a full box payload into (version, flags, body).
    pub fn full_box(&self) -> Result<(u8, u32, &'a [u8]), BoxError> {
        if self.payload.len() < 4 {
            return Err(BoxError::new(&self.box_type, self.start, "missing full box header"));
        }
        let flags = u32::from_be_bytes([0, self.payload[1], self.payload[2], self.payload[3]]);
        Ok((self.payload[0], flags, &self.payload[4..]))
    }
}

/// Sequential box reader over one nesting level.
#[derive(Debug, Clone)]
pub struct BoxIter<'a> {
    data: &'a [u8],
    offset: usize,
    base: usize,
    failed: bool,
}

impl<'a> BoxIter<'a> {
    /// Iterate the top-level boxes of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    fn with_base(data: &'a [u8], base: usize) -> Self {
        Self {
            data,
            offset: 0,
            base,
            failed: false,
        }
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<Mp4Box<'a>, BoxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let rest = &self.data[self.offset..];
        let start = self.base + self.offset;
        if rest.len() < 8 {
            self.failed = true;
            return Some(Err(BoxError::new(b"????", start, "truncated box header")));
        }

        let box_type: FourCc = [rest[4], rest[5], rest[6], rest[7]];
        let (size, header_len) = match u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) {
            0 => (rest.len(), 8),
            1 => {
                if rest.len() < 16 {
                    self.failed = true;
                    return Some(Err(BoxError::new(&box_type, start, "truncated large size")));
                }
                let mut large = [0u8; 8];
                large.copy_from_slice(&rest[8..16]);
                (u64::from_be_bytes(large) as usize, 16)
            }
            size => (size as usize, 8),
        };

        if size < header_len || size > rest.len() {
            self.failed = true;
            return Some(Err(BoxError::new(
                &box_type,
                start,
                format!("size {} exceeds {} available bytes", size, rest.len()),
            )));
        }

        self.offset += size;
        Some(Ok(Mp4Box {
            box_type,
            start,
            header_len,
            payload: &rest[header_len..size],
        }))
    }
}

/// Visit every box reachable through known containers, depth first.
pub fn walk<'a, F>(data: &'a [u8], visit: &mut F) -> Result<(), BoxError>
where
    F: FnMut(&Mp4Box<'a>) -> Result<(), BoxError>,
{
    walk_level(BoxIter::new(data), visit)
}

fn walk_level<'a, F>(iter: BoxIter<'a>, visit: &mut F) -> Result<(), BoxError>
where
    F: FnMut(&Mp4Box<'a>) -> Result<(), BoxError>,
{
    for item in iter {
        let b = item?;
        visit(&b)?;

        if CONTAINERS.contains(&&b.box_type) {
            walk_level(b.children(0), visit)?;
        } else if &b.box_type == b"stsd" {
            // full box header + entry count
            walk_level(b.children(8), visit)?;
        } else if AUDIO_ENTRIES.contains(&&b.box_type) {
            walk_level(b.children(audio_entry_header_len(&b)), visit)?;
        } else if VISUAL_ENTRIES.contains(&&b.box_type) {
            walk_level(b.children(78), visit)?;
        }
    }
    Ok(())
}

fn audio_entry_header_len(entry: &Mp4Box<'_>) -> usize {
    // SampleEntry (8) + AudioSampleEntry (20); QuickTime v1/v2 extend it
    let version = entry
        .payload
        .get(8..10)
        .map(|v| u16::from_be_bytes([v[0], v[1]]))
        .unwrap_or(0);
    match version {
        1 => 28 + 16,
        2 => 28 + 36,
        _ => 28,
    }
}

/// Raw bytes of every `pssh` box, in file order.
pub fn find_pssh_boxes(data: &[u8]) -> Result<Vec<&[u8]>, BoxError> {
    let mut found = Vec::new();
    walk(data, &mut |b| {
        if &b.box_type == b"pssh" {
            found.push(&data[b.start..b.start + b.size()]);
        }
        Ok(())
    })?;
    Ok(found)
}

/// Does `data` start with a box type that appears at the top of MP4 files?
#[must_use]
pub fn looks_like_mp4(data: &[u8]) -> bool {
    const TOP_LEVEL: &[&FourCc] = &[
        b"ftyp", b"styp", b"moov", b"moof", b"sidx", b"free", b"skip", b"emsg", b"mdat", b"prft",
        b"pssh",
    ];
    data.len() >= 8 && TOP_LEVEL.iter().any(|t| &data[4..8] == *t)
}

/// Track encryption parameters from an init segment (`frma`/`schm`/`tenc`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEncryption {
    /// Protection scheme, e.g. `cenc`.
    pub scheme: FourCc,
    /// Codec of the protected sample entry, e.g. `mp4a`.
    pub original_format: Option<FourCc>,
    pub protected: bool,
    /// Per-sample IV size in `senc` (0, 8 or 16).
    pub iv_size: u8,
    pub default_kid: KeyId,
    pub constant_iv: Option<Vec<u8>>,
}

impl TrackEncryption {
    /// Parse the first protected track of an init segment.
    ///
    /// Returns `None` when the init segment carries no `tenc` box.
    pub fn from_init(data: &[u8]) -> Result<Option<Self>, BoxError> {
        let mut scheme = None;
        let mut original_format = None;
        let mut tenc = None;

        walk(data, &mut |b| {
            match &b.box_type {
                b"frma" if original_format.is_none() => {
                    original_format = b.payload.get(..4).map(|f| [f[0], f[1], f[2], f[3]]);
                }
                b"schm" if scheme.is_none() => {
                    let (_, _, body) = b.full_box()?;
                    scheme = body.get(..4).map(|f| [f[0], f[1], f[2], f[3]]);
                }
                b"tenc" if tenc.is_none() => tenc = Some(parse_tenc(b)?),
                _ => {}
            }
            Ok(())
        })?;

        Ok(tenc.map(|(protected, iv_size, default_kid, constant_iv)| Self {
            scheme: scheme.unwrap_or(SCHEME_CENC),
            original_format,
            protected,
            iv_size,
            default_kid,
            constant_iv,
        }))
    }

    /// Only `cenc` (AES-128-CTR) is supported.
    pub fn ensure_supported(&self) -> Result<(), DecryptionError> {
        if self.scheme != SCHEME_CENC {
            return Err(DecryptionError::UnsupportedScheme(
                String::from_utf8_lossy(&self.scheme).into_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_tenc(b: &Mp4Box<'_>) -> Result<(bool, u8, KeyId, Option<Vec<u8>>), BoxError> {
    let (_, _, body) = b.full_box()?;
    let mut reader = Cursor::new(body);
    let mut read = || -> std::io::Result<(bool, u8, KeyId, Option<Vec<u8>>)> {
        // reserved, then reserved (v0) or crypt/skip pattern (v1)
        reader.read_u16::<BigEndian>()?;
        let protected = reader.read_u8()? != 0;
        let iv_size = reader.read_u8()?;
        let mut kid = [0u8; 16];
        std::io::Read::read_exact(&mut reader, &mut kid)?;

        let mut constant_iv = None;
        if protected && iv_size == 0 {
            let len = reader.read_u8()? as usize;
            let mut iv = vec![0u8; len];
            std::io::Read::read_exact(&mut reader, &mut iv)?;
            constant_iv = Some(iv);
        }
        Ok((protected, iv_size, KeyId::from_bytes(kid), constant_iv))
    };
    read().map_err(|e| BoxError::new(&b.box_type, b.start, e.to_string()))
}

/// One encrypted sample and where it lives in its fragment.
#[derive(Debug, Clone)]
pub struct CencSample {
    /// Offset of the sample data within the fragment buffer.
    pub position: usize,
    pub segment: EncryptedSegment,
}

#[derive(Debug, Default)]
struct TrackFragment {
    base_data_offset: Option<u64>,
    default_sample_size: Option<u32>,
    data_offset: Option<i32>,
    sample_sizes: Vec<Option<u32>>,
    senc: Option<Vec<SencEntry>>,
}

#[derive(Debug)]
struct SencEntry {
    iv: Vec<u8>,
    subsamples: Vec<(u16, u32)>,
}

/// Extract every encrypted sample of a media segment.
///
/// Each `moof` is paired with the `mdat` that follows it. Sample offsets come
/// from `tfhd`/`trun`; IVs and subsample maps from `senc`.
pub fn parse_fragment(
    data: &[u8],
    track: &TrackEncryption,
) -> Result<Vec<CencSample>, DecryptionError> {
    let mut samples = Vec::new();
    let mut pending_moof: Option<Mp4Box<'_>> = None;

    for item in BoxIter::new(data) {
        let b = item?;
        match &b.box_type {
            b"moof" => pending_moof = Some(b),
            b"mdat" => {
                let moof = pending_moof.take().ok_or_else(|| {
                    DecryptionError::Fragment("mdat without preceding moof".to_string())
                })?;
                for item in moof.children(0) {
                    let traf = item?;
                    if &traf.box_type == b"traf" {
                        let fragment = parse_traf(&traf, track)?;
                        collect_samples(data, &moof, &b, fragment, track, &mut samples)?;
                    }
                }
            }
            _ => {}
        }
    }

    if pending_moof.is_some() {
        return Err(DecryptionError::Fragment("moof without mdat".to_string()));
    }
    Ok(samples)
}

fn parse_traf(traf: &Mp4Box<'_>, track: &TrackEncryption) -> Result<TrackFragment, BoxError> {
    let mut fragment = TrackFragment::default();

    for item in traf.children(0) {
        let b = item?;
        let fail = |e: std::io::Error| BoxError::new(&b.box_type, b.start, e.to_string());
        match &b.box_type {
            b"tfhd" => {
                let (_, flags, body) = b.full_box()?;
                let mut r = Cursor::new(body);
                r.read_u32::<BigEndian>().map_err(fail)?; // track id
                if flags & 0x01 != 0 {
                    fragment.base_data_offset = Some(r.read_u64::<BigEndian>().map_err(fail)?);
                }
                if flags & 0x02 != 0 {
                    r.read_u32::<BigEndian>().map_err(fail)?;
                }
                if flags & 0x08 != 0 {
                    r.read_u32::<BigEndian>().map_err(fail)?;
                }
                if flags & 0x10 != 0 {
                    fragment.default_sample_size = Some(r.read_u32::<BigEndian>().map_err(fail)?);
                }
            }
            b"trun" => {
                let (_, flags, body) = b.full_box()?;
                let mut r = Cursor::new(body);
                let count = r.read_u32::<BigEndian>().map_err(fail)?;
                if flags & 0x01 != 0 {
                    fragment.data_offset = Some(r.read_i32::<BigEndian>().map_err(fail)?);
                }
                if flags & 0x04 != 0 {
                    r.read_u32::<BigEndian>().map_err(fail)?;
                }
                for _ in 0..count {
                    if flags & 0x100 != 0 {
                        r.read_u32::<BigEndian>().map_err(fail)?;
                    }
                    let size = if flags & 0x200 != 0 {
                        Some(r.read_u32::<BigEndian>().map_err(fail)?)
                    } else {
                        None
                    };
                    fragment.sample_sizes.push(size);
                    if flags & 0x400 != 0 {
                        r.read_u32::<BigEndian>().map_err(fail)?;
                    }
                    if flags & 0x800 != 0 {
                        r.read_u32::<BigEndian>().map_err(fail)?;
                    }
                }
            }
            b"senc" => {
                let (_, flags, body) = b.full_box()?;
                let mut r = Cursor::new(body);
                let count = r.read_u32::<BigEndian>().map_err(fail)?;
                let mut entries = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    let iv = match (track.iv_size, &track.constant_iv) {
                        (0, Some(iv)) => iv.clone(),
                        (size, _) => {
                            let mut iv = vec![0u8; size as usize];
                            std::io::Read::read_exact(&mut r, &mut iv).map_err(fail)?;
                            iv
                        }
                    };
                    let mut subsamples = Vec::new();
                    if flags & 0x02 != 0 {
                        let n = r.read_u16::<BigEndian>().map_err(fail)?;
                        for _ in 0..n {
                            let clear = r.read_u16::<BigEndian>().map_err(fail)?;
                            let encrypted = r.read_u32::<BigEndian>().map_err(fail)?;
                            subsamples.push((clear, encrypted));
                        }
                    }
                    entries.push(SencEntry { iv, subsamples });
                }
                fragment.senc = Some(entries);
            }
            _ => {}
        }
    }
    Ok(fragment)
}

fn collect_samples(
    data: &[u8],
    moof: &Mp4Box<'_>,
    mdat: &Mp4Box<'_>,
    fragment: TrackFragment,
    track: &TrackEncryption,
    out: &mut Vec<CencSample>,
) -> Result<(), DecryptionError> {
    let senc = fragment.senc.ok_or_else(|| {
        DecryptionError::Fragment("track fragment has no senc box".to_string())
    })?;
    if senc.len() != fragment.sample_sizes.len() {
        return Err(DecryptionError::Fragment(format!(
            "senc describes {} samples, trun {}",
            senc.len(),
            fragment.sample_sizes.len()
        )));
    }

    let mut position = match fragment.data_offset {
        Some(offset) => {
            let base = fragment.base_data_offset.unwrap_or(moof.start as u64);
            i64::try_from(base)
                .ok()
                .and_then(|base| base.checked_add(i64::from(offset)))
                .and_then(|position| usize::try_from(position).ok())
                .ok_or_else(|| {
                    DecryptionError::Fragment(format!(
                        "data offset {} from base {} is out of range",
                        offset, base
                    ))
                })?
        }
        None => mdat.payload_start(),
    };

    for (size, entry) in fragment.sample_sizes.iter().zip(senc) {
        let size = size
            .or(fragment.default_sample_size)
            .ok_or_else(|| DecryptionError::Fragment("sample size unknown".to_string()))?
            as usize;
        let end = position.saturating_add(size);
        if position < mdat.payload_start() || end > mdat.start + mdat.size() {
            return Err(DecryptionError::Fragment(format!(
                "sample at {}..{} lies outside mdat",
                position, end
            )));
        }

        let mut iv = [0u8; 16];
        let n = entry.iv.len().min(16);
        iv[..n].copy_from_slice(&entry.iv[..n]);

        let ranges = if entry.subsamples.is_empty() {
            vec![SampleRange::encrypted(0, size)]
        } else {
            let mut ranges = Vec::with_capacity(entry.subsamples.len() * 2);
            let mut offset = 0;
            for (clear, encrypted) in entry.subsamples {
                for (length, is_encrypted) in [(clear as usize, false), (encrypted as usize, true)]
                {
                    if length > 0 {
                        ranges.push(SampleRange {
                            offset,
                            length,
                            encrypted: is_encrypted,
                        });
                        offset += length;
                    }
                }
            }
            ranges
        };

        out.push(CencSample {
            position,
            segment: EncryptedSegment {
                key_id: track.default_kid,
                iv,
                ranges,
                data: data[position..end].to_vec(),
            },
        });
        position = end;
    }
    Ok(())
}

fn rename_boxes(data: &mut [u8], renames: &[(usize, FourCc)]) {
    for (start, to) in renames {
        data[start + 4..start + 8].copy_from_slice(to);
    }
}

/// Turn a protected init segment into a clear one, in place.
///
/// The protected sample entry takes its `frma` format, and `sinf` and `pssh`
/// boxes become `free`.
pub fn clear_init(data: &mut [u8]) -> Result<(), BoxError> {
    let mut renames = Vec::new();
    walk(data, &mut |b| {
        match &b.box_type {
            b"enca" | b"encv" => {
                let format = b
                    .children(if &b.box_type == b"enca" { audio_entry_header_len(b) } else { 78 })
                    .filter_map(|c| c.ok())
                    .find(|c| &c.box_type == b"sinf")
                    .and_then(|sinf| {
                        sinf.children(0)
                            .filter_map(|c| c.ok())
                            .find(|c| &c.box_type == b"frma")
                    })
                    .and_then(|frma| frma.payload.get(..4).map(|f| [f[0], f[1], f[2], f[3]]))
                    .ok_or_else(|| BoxError::new(&b.box_type, b.start, "no frma box"))?;
                renames.push((b.start, format));
            }
            b"sinf" | b"pssh" => renames.push((b.start, *b"free")),
            _ => {}
        }
        Ok(())
    })?;
    rename_boxes(data, &renames);
    Ok(())
}

/// Rename the sample encryption boxes of a media segment to `free`, in place.
pub fn clear_fragment(data: &mut [u8]) -> Result<(), BoxError> {
    let mut renames = Vec::new();
    walk(data, &mut |b| {
        if FRAGMENT_PROTECTION_BOXES.contains(&&b.box_type) {
            renames.push((b.start, *b"free"));
        }
        Ok(())
    })?;
    rename_boxes(data, &renames);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{full_box, make_fragment, make_init, mp4_box, FixtureSample};

    fn kid() -> KeyId {
        KeyId::from_bytes([0x11; 16])
    }

    #[test]
    fn truncated_box_is_reported() {
        let mut data = mp4_box(b"moov", &[0u8; 16]);
        data.truncate(12);
        let err = BoxIter::new(&data).next().expect("item").expect_err("truncated");
        assert_eq!(err.box_type, "moov");
    }

    #[test]
    fn finds_pssh_inside_moov() {
        let pssh = mp4_box(b"pssh", &[0u8; 24]);
        let init = make_init(kid(), b"cenc", Some(&pssh));
        let found = find_pssh_boxes(&init).expect("walk");
        assert_eq!(found, vec![pssh.as_slice()]);
    }

    #[test]
    fn reads_track_encryption() {
        let init = make_init(kid(), b"cenc", None);
        let track = TrackEncryption::from_init(&init).expect("parse").expect("tenc");
        assert_eq!(track.default_kid, kid());
        assert_eq!(track.iv_size, 8);
        assert_eq!(track.original_format, Some(*b"mp4a"));
        assert!(track.protected);
        assert!(track.ensure_supported().is_ok());
    }

    #[test]
    fn cbcs_is_unsupported() {
        let init = make_init(kid(), b"cbcs", None);
        let track = TrackEncryption::from_init(&init).expect("parse").expect("tenc");
        assert!(matches!(
            track.ensure_supported(),
            Err(DecryptionError::UnsupportedScheme(s)) if s == "cbcs"
        ));
    }

    #[test]
    fn clear_init_keeps_length_and_restores_codec() {
        let pssh = mp4_box(b"pssh", &[0u8; 24]);
        let mut init = make_init(kid(), b"cenc", Some(&pssh));
        let len = init.len();
        clear_init(&mut init).expect("clear");

        assert_eq!(init.len(), len);
        assert!(TrackEncryption::from_init(&init).expect("walk").is_none());
        assert!(find_pssh_boxes(&init).expect("walk").is_empty());
        assert!(init.windows(4).any(|w| w == b"mp4a"));
        assert!(!init.windows(4).any(|w| w == b"enca"));
    }

    #[test]
    fn fragment_samples_carry_iv_and_subsamples() {
        let samples = vec![
            FixtureSample {
                iv: [1; 8],
                subsamples: None,
                data: vec![0xaa; 40],
            },
            FixtureSample {
                iv: [2; 8],
                subsamples: Some(vec![(5, 20), (3, 0)]),
                data: vec![0xbb; 28],
            },
        ];
        let fragment = make_fragment(&samples);
        let init = make_init(kid(), b"cenc", None);
        let track = TrackEncryption::from_init(&init).expect("parse").expect("tenc");

        let parsed = parse_fragment(&fragment, &track).expect("parse fragment");
        assert_eq!(parsed.len(), 2);

        let first = &parsed[0];
        assert_eq!(&first.segment.iv[..8], &[1; 8]);
        assert_eq!(&first.segment.iv[8..], &[0; 8]);
        assert_eq!(first.segment.ranges, vec![SampleRange::encrypted(0, 40)]);
        assert_eq!(&fragment[first.position..first.position + 40], &[0xaa; 40][..]);

        let second = &parsed[1];
        assert_eq!(second.position, first.position + 40);
        assert_eq!(
            second.segment.ranges,
            vec![
                SampleRange {
                    offset: 0,
                    length: 5,
                    encrypted: false
                },
                SampleRange::encrypted(5, 20),
                SampleRange {
                    offset: 25,
                    length: 3,
                    encrypted: false
                },
            ]
        );
    }

    #[test]
    fn clear_fragment_renames_senc() {
        let mut fragment = make_fragment(&[FixtureSample {
            iv: [1; 8],
            subsamples: None,
            data: vec![0; 16],
        }]);
        clear_fragment(&mut fragment).expect("clear");
        assert!(!fragment.windows(4).any(|w| w == b"senc"));
        assert!(fragment.windows(4).any(|w| w == b"trun"));
    }

    #[test]
    fn mdat_without_moof_is_rejected() {
        let data = mp4_box(b"mdat", &[0; 8]);
        let init = make_init(kid(), b"cenc", None);
        let track = TrackEncryption::from_init(&init).expect("parse").expect("tenc");
        assert!(matches!(
            parse_fragment(&data, &track),
            Err(DecryptionError::Fragment(_))
        ));
    }

    #[test]
    fn out_of_range_data_offset_is_rejected() {
        let init = make_init(kid(), b"cenc", None);
        let track = TrackEncryption::from_init(&init).expect("parse").expect("tenc");

        for base in [i64::MAX as u64, u64::MAX] {
            let mut tfhd = 1u32.to_be_bytes().to_vec();
            tfhd.extend_from_slice(&base.to_be_bytes());
            let mut trun = 1u32.to_be_bytes().to_vec();
            trun.extend_from_slice(&1i32.to_be_bytes());
            trun.extend_from_slice(&4u32.to_be_bytes());
            let mut senc = 1u32.to_be_bytes().to_vec();
            senc.extend_from_slice(&[0; 8]);
            let traf = [
                full_box(b"tfhd", 0, 0x01, &tfhd),
                full_box(b"trun", 0, 0x201, &trun),
                full_box(b"senc", 0, 0, &senc),
            ]
            .concat();
            let data = [mp4_box(b"moof", &mp4_box(b"traf", &traf)), mp4_box(b"mdat", &[0; 4])].concat();

            assert!(matches!(
                parse_fragment(&data, &track),
                Err(DecryptionError::Fragment(_))
            ));
        }
    }
}
