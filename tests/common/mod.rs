//! Integration test fixtures: a fake license server, a fake CDN and a
//! recording muxer, on top of the fixtures the unit tests use.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;

use rsmusicdl::device::{DeviceCredential, DeviceType};
use rsmusicdl::error::{Error, LicenseError, Result};
use rsmusicdl::fetch::Fetcher;
use rsmusicdl::key::{ContentKey, KeyId};
use rsmusicdl::license::{
    request_id_of, verify_request, LicenseTransport, COMMON_PRIVACY_CERT,
    SERVICE_CERTIFICATE_CHALLENGE,
};
use rsmusicdl::license_protocol::license::key_container::KeyType;
use rsmusicdl::license_protocol::LicenseRequest;
use rsmusicdl::mux::Muxer;
use rsmusicdl::pipeline::CancelToken;

#[path = "../../src/testutil.rs"]
mod fixtures;

pub use fixtures::*;

pub const BASE: &str = "https://cdn.test/track";
pub const PLAYLIST_URL: &str = "https://cdn.test/track/index.m3u8";
pub const SYSTEM_ID: u32 = 7283;

pub fn credential() -> DeviceCredential {
    make_credential(DeviceType::Android, SYSTEM_ID)
}

/// An AAC init segment protected with `cenc` under `kid`.
pub fn encrypted_init(kid: KeyId, with_pssh: bool) -> Vec<u8> {
    let pssh = with_pssh.then(|| make_pssh(kid));
    make_init(kid, b"cenc", pssh.as_deref())
}

/// What the fake license server does with the next license request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Issue,
    /// Issue a license whose HMAC does not verify.
    BadSignature,
    /// Fail at the transport level.
    Unavailable,
}

/// A license server that issues keys for a fixed set of key ids. Service
/// certificate requests are answered with the common privacy certificate.
#[derive(Clone)]
pub struct FakeLicenseServer {
    kids: Vec<KeyId>,
    script: Arc<Mutex<Vec<Reply>>>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    certificate_requests: Arc<AtomicUsize>,
}

impl FakeLicenseServer {
    pub fn new(kids: &[KeyId], script: &[Reply]) -> Self {
        Self {
            kids: kids.to_vec(),
            script: Arc::new(Mutex::new(script.to_vec())),
            requests: Arc::default(),
            certificate_requests: Arc::default(),
        }
    }

    /// License requests received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("lock").len()
    }

    pub fn certificate_requests(&self) -> usize {
        self.certificate_requests.load(Ordering::SeqCst)
    }

    /// Every license request received, in order, after signature checks.
    pub fn requests(&self) -> Vec<LicenseRequest> {
        let public_key = test_private_key().to_public_key();
        self.requests
            .lock()
            .expect("lock")
            .iter()
            .map(|body| verify_request(body, &public_key).expect("verify"))
            .collect()
    }

    /// Request ids of every license request received, in order.
    pub fn request_ids(&self) -> Vec<Vec<u8>> {
        self.requests()
            .iter()
            .map(|request| request_id_of(request).expect("request id").to_vec())
            .collect()
    }
}

impl LicenseTransport for FakeLicenseServer {
    fn post(&self, _url: &str, body: &[u8]) -> std::result::Result<Vec<u8>, LicenseError> {
        if body == SERVICE_CERTIFICATE_CHALLENGE {
            self.certificate_requests.fetch_add(1, Ordering::SeqCst);
            return Ok(base64::engine::general_purpose::STANDARD
                .decode(COMMON_PRIVACY_CERT)
                .expect("common certificate"));
        }

        self.requests.lock().expect("lock").push(body.to_vec());
        let reply = {
            let mut script = self.script.lock().expect("lock");
            if script.is_empty() {
                Reply::Issue
            } else {
                script.remove(0)
            }
        };
        let keys: Vec<_> = self.kids.iter().map(|kid| (KeyType::Content, *kid)).collect();
        let public_key = test_private_key().to_public_key();
        match reply {
            Reply::Unavailable => Err(LicenseError::Network("503 Service Unavailable".to_string())),
            Reply::Issue => Ok(issue_license(body, &public_key, &keys)),
            Reply::BadSignature => Ok(tamper_license(&issue_license(body, &public_key, &keys))),
        }
    }
}

/// Audio payload used by the end-to-end tests: three segments of two
/// samples each, one of them with a clear header.
pub fn plain_samples() -> Vec<Vec<FixtureSample>> {
    (0u8..3)
        .map(|segment| {
            let first: Vec<u8> = (0..45u8).map(|i| i.wrapping_mul(segment + 3)).collect();
            let second: Vec<u8> = (0..70u8).map(|i| i ^ (segment * 17)).collect();
            vec![
                FixtureSample {
                    iv: [segment * 2 + 1; 8],
                    subsamples: None,
                    data: first,
                },
                FixtureSample {
                    iv: [segment * 2 + 2; 8],
                    subsamples: Some(vec![(7, second.len() as u32 - 7)]),
                    data: second,
                },
            ]
        })
        .collect()
}

/// Encrypt `plain` segment by segment, or as one keystream if `continuous`.
pub fn encrypt_stream(
    plain: &[Vec<FixtureSample>],
    key: &ContentKey,
    continuous: bool,
) -> Vec<Vec<u8>> {
    if continuous {
        let flat: Vec<FixtureSample> = plain.iter().flatten().cloned().collect();
        let mut encrypted = cenc_transform(&flat, key, true).into_iter();
        plain
            .iter()
            .map(|segment| {
                make_fragment(&encrypted.by_ref().take(segment.len()).collect::<Vec<_>>())
            })
            .collect()
    } else {
        plain
            .iter()
            .map(|segment| make_fragment(&cenc_transform(segment, key, false)))
            .collect()
    }
}

/// In-memory CDN serving one playlist, its init segment and media segments.
pub struct FakeCdn {
    files: HashMap<String, Vec<u8>>,
    fetches: AtomicUsize,
    log: Mutex<Vec<String>>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl FakeCdn {
    pub fn new(init: Vec<u8>, segments: Vec<Vec<u8>>, key_line: &str) -> Self {
        let mut playlist = format!(
            "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n{}#EXT-X-MAP:URI=\"init.mp4\"\n",
            key_line
        );
        let mut files = HashMap::new();
        files.insert(format!("{}/init.mp4", BASE), init);
        for (i, segment) in segments.into_iter().enumerate() {
            playlist.push_str(&format!("#EXTINF:6.0,\nsegment-{}.m4s\n", i));
            files.insert(format!("{}/segment-{}.m4s", BASE, i), segment);
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        files.insert(PLAYLIST_URL.to_string(), playlist.into_bytes());
        Self {
            files,
            fetches: AtomicUsize::new(0),
            log: Mutex::default(),
            cancel_after: None,
        }
    }

    /// Trip `token` once `fetches` requests have been served.
    pub fn cancel_after(mut self, fetches: usize, token: CancelToken) -> Self {
        self.cancel_after = Some((fetches, token));
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("lock").clone()
    }

    pub fn segment_fetches(&self) -> usize {
        self.log().iter().filter(|url| url.ends_with(".m4s")).count()
    }
}

impl Fetcher for FakeCdn {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.log.lock().expect("lock").push(url.to_string());
        let served = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if served >= *limit {
                token.cancel();
            }
        }
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Fetch(format!("{}: HTTP 404", url)))
    }
}

/// Collects output and records whether `finish` ran.
#[derive(Debug, Default)]
pub struct RecordingMuxer {
    pub data: Vec<u8>,
    pub writes: usize,
    pub finished: bool,
}

impl Muxer for RecordingMuxer {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
