//! Test fixtures: a throwaway device, a license server stand-in and fMP4
//! builders.
//!
//! Compiled into the unit tests as `crate::testutil` and into the integration
//! tests through `tests/common`, so it only names items by their public
//! `rsmusicdl::` paths.
#![allow(dead_code)]

use std::sync::OnceLock;

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use ctr::cipher::StreamCipher;
use hmac::{Hmac, Mac};
use prost::Message;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::rand_core::{OsRng, RngCore};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;

use rsmusicdl::device::{DeviceCredential, DeviceType};
use rsmusicdl::key::{ContentKey, KeyId};
use rsmusicdl::license::{request_id_of, sign_pss_sha1, verify_request};
use rsmusicdl::pssh::Pssh;
use rsmusicdl::license_protocol::drm_certificate::Type as CertificateType;
use rsmusicdl::license_protocol::license::key_container::KeyType;
use rsmusicdl::license_protocol::license::KeyContainer;
use rsmusicdl::license_protocol::signed_message::MessageType;
use rsmusicdl::license_protocol::{
    ClientIdentification, DrmCertificate, License, LicenseError as LicenseErrorMessage,
    LicenseIdentification, SignedDrmCertificate, SignedMessage,
};
use rsmusicdl::session::SessionState;

pub fn test_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).expect("generate test key"))
}

fn certificate(key: &RsaPrivateKey, kind: CertificateType, system_id: u32) -> Vec<u8> {
    let public_key = key
        .to_public_key()
        .to_pkcs1_der()
        .expect("encode public key")
        .as_bytes()
        .to_vec();
    DrmCertificate {
        r#type: Some(kind as i32),
        serial_number: Some(vec![kind as u8; 16]),
        public_key: Some(public_key),
        system_id: Some(system_id),
        ..Default::default()
    }
    .encode_to_vec()
}

/// A two-level chain token: a `leaf_type` certificate signed by a
/// DEVICE_MODEL intermediate that shares the same key.
pub fn make_chain_token(key: &RsaPrivateKey, system_id: u32, leaf_type: CertificateType) -> Vec<u8> {
    let signer = SignedDrmCertificate {
        drm_certificate: Some(certificate(key, CertificateType::DeviceModel, system_id)),
        ..Default::default()
    };
    let leaf = certificate(key, leaf_type, system_id);
    let signature = sign_pss_sha1(key, &leaf).expect("sign leaf");
    SignedDrmCertificate {
        drm_certificate: Some(leaf),
        signature: Some(signature),
        signer: Some(Box::new(signer)),
        ..Default::default()
    }
    .encode_to_vec()
}

pub fn make_credential(device_type: DeviceType, system_id: u32) -> DeviceCredential {
    let key = test_private_key();
    let client_id = ClientIdentification {
        token: Some(make_chain_token(key, system_id, CertificateType::Device)),
        ..Default::default()
    };
    DeviceCredential::new(device_type, 3, 0, key.clone(), client_id).expect("credential")
}

/// The content key the fake license server issues for `kid`.
pub fn content_key_for(kid: KeyId) -> ContentKey {
    let mut key = *kid.as_bytes();
    key.iter_mut().for_each(|b| *b ^= 0xa5);
    ContentKey::new(key)
}

/// Answer a signed license request the way a license server would.
pub fn issue_license(body: &[u8], device_key: &RsaPublicKey, keys: &[(KeyType, KeyId)]) -> Vec<u8> {
    let request = verify_request(body, device_key).expect("request verifies");
    let request_id = request_id_of(&request).expect("request id").to_vec();
    let request_bytes = SignedMessage::decode(body)
        .expect("signed message")
        .msg
        .expect("request bytes");
    let session = SessionState::new(request_id.clone(), &request_bytes);

    let mut session_key = [0u8; 16];
    OsRng.fill_bytes(&mut session_key);
    let wrapped = device_key
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &session_key)
        .expect("wrap session key");
    let derived = session.derive_keys(&session_key).expect("derive");
    let enc_key: [u8; 16] = derived.enc_key.as_slice().try_into().expect("enc key");

    let containers = keys
        .iter()
        .map(|(kind, kid)| {
            let mut iv = [0u8; 16];
            OsRng.fill_bytes(&mut iv);
            let key = cbc::Encryptor::<Aes128>::new(&enc_key.into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(content_key_for(*kid).as_bytes());
            KeyContainer {
                id: Some(kid.as_bytes().to_vec()),
                iv: Some(iv.to_vec()),
                key: Some(key),
                r#type: Some(*kind as i32),
                ..Default::default()
            }
        })
        .collect();

    let msg = License {
        id: Some(LicenseIdentification {
            request_id: Some(request_id),
            ..Default::default()
        }),
        key: containers,
        ..Default::default()
    }
    .encode_to_vec();

    let mut mac = Hmac::<Sha256>::new_from_slice(&derived.mac_key_server).expect("hmac key");
    mac.update(&msg);

    SignedMessage {
        r#type: Some(MessageType::License as i32),
        msg: Some(msg),
        signature: Some(mac.finalize().into_bytes().to_vec()),
        session_key: Some(wrapped),
        ..Default::default()
    }
    .encode_to_vec()
}

/// Corrupt the HMAC of an issued license.
pub fn tamper_license(response: &[u8]) -> Vec<u8> {
    let mut signed = SignedMessage::decode(response).expect("signed message");
    if let Some(signature) = signed.signature.as_mut() {
        signature[0] ^= 0xff;
    }
    signed.encode_to_vec()
}

pub fn make_error_response(code: i32) -> Vec<u8> {
    SignedMessage {
        r#type: Some(MessageType::ErrorResponse as i32),
        msg: Some(
            LicenseErrorMessage {
                error_code: Some(code),
            }
            .encode_to_vec(),
        ),
        ..Default::default()
    }
    .encode_to_vec()
}

pub fn mp4_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(payload);
    out
}

pub fn full_box(box_type: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut payload = vec![version];
    payload.extend_from_slice(&flags.to_be_bytes()[1..]);
    payload.extend_from_slice(body);
    mp4_box(box_type, &payload)
}

/// A Widevine `pssh` box listing `kid`.
pub fn make_pssh(kid: KeyId) -> Vec<u8> {
    Pssh::from_key_ids(&[kid]).expect("pssh").to_bytes()
}

/// A one-track audio init segment protected with `scheme` under `kid`.
pub fn make_init(kid: KeyId, scheme: &[u8; 4], pssh: Option<&[u8]>) -> Vec<u8> {
    let mut tenc = vec![0, 0, 1, 8];
    tenc.extend_from_slice(kid.as_bytes());
    let mut schm = scheme.to_vec();
    schm.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    let sinf = mp4_box(
        b"sinf",
        &[
            mp4_box(b"frma", b"mp4a"),
            full_box(b"schm", 0, 0, &schm),
            mp4_box(b"schi", &full_box(b"tenc", 0, 0, &tenc)),
        ]
        .concat(),
    );

    // SampleEntry + AudioSampleEntry v0: 2 channels, 16 bit, 44100 Hz
    let mut enca = vec![0, 0, 0, 0, 0, 0, 0, 1];
    enca.extend_from_slice(&[0; 8]);
    enca.extend_from_slice(&[0, 2, 0, 16, 0, 0, 0, 0]);
    enca.extend_from_slice(&(44_100u32 << 16).to_be_bytes());
    enca.extend_from_slice(&full_box(b"esds", 0, 0, &[3, 0]));
    enca.extend_from_slice(&sinf);

    let mut stsd = 1u32.to_be_bytes().to_vec();
    stsd.extend_from_slice(&mp4_box(b"enca", &enca));
    let trak = mp4_box(
        b"trak",
        &mp4_box(
            b"mdia",
            &mp4_box(b"minf", &mp4_box(b"stbl", &full_box(b"stsd", 0, 0, &stsd))),
        ),
    );

    let mut moov = pssh.map(<[u8]>::to_vec).unwrap_or_default();
    moov.extend_from_slice(&trak);
    [mp4_box(b"ftyp", b"iso6\0\0\0\0iso6cmfc"), mp4_box(b"moov", &moov)].concat()
}

/// One sample of a media fixture.
#[derive(Debug, Clone)]
pub struct FixtureSample {
    pub iv: [u8; 8],
    /// `(clear, encrypted)` pairs; `None` encrypts the whole sample.
    pub subsamples: Option<Vec<(u16, u32)>>,
    pub data: Vec<u8>,
}

impl FixtureSample {
    /// Byte ranges of the sample that are encrypted.
    fn encrypted_ranges(&self) -> Vec<std::ops::Range<usize>> {
        match &self.subsamples {
            None => vec![0..self.data.len()],
            Some(pairs) => {
                let mut offset = 0;
                pairs
                    .iter()
                    .map(|&(clear, encrypted)| {
                        let start = offset + clear as usize;
                        offset = start + encrypted as usize;
                        start..offset
                    })
                    .collect()
            }
        }
    }
}

/// Apply the CENC transform to the sample data. With `continuous`, one
/// keystream seeded by the first IV runs across all samples.
pub fn cenc_transform(samples: &[FixtureSample], key: &ContentKey, continuous: bool) -> Vec<FixtureSample> {
    type Aes128Ctr = ctr::Ctr128BE<Aes128>;
    let new_cipher = |iv: &[u8; 8]| {
        let mut full = [0u8; 16];
        full[..8].copy_from_slice(iv);
        Aes128Ctr::new(key.as_bytes().into(), &full.into())
    };

    let mut shared = samples.first().map(|s| new_cipher(&s.iv));
    samples
        .iter()
        .map(|sample| {
            let mut own = new_cipher(&sample.iv);
            let cipher = match shared.as_mut() {
                Some(shared) if continuous => shared,
                _ => &mut own,
            };
            let mut data = sample.data.clone();
            for range in sample.encrypted_ranges() {
                cipher.apply_keystream(&mut data[range]);
            }
            FixtureSample {
                data,
                ..sample.clone()
            }
        })
        .collect()
}

/// A `moof`/`mdat` media segment with one track fragment carrying `senc`.
pub fn make_fragment(samples: &[FixtureSample]) -> Vec<u8> {
    let with_subsamples = samples.iter().any(|s| s.subsamples.is_some());

    let mut senc = (samples.len() as u32).to_be_bytes().to_vec();
    for sample in samples {
        senc.extend_from_slice(&sample.iv);
        if with_subsamples {
            let pairs = sample.subsamples.as_deref().unwrap_or_default();
            senc.extend_from_slice(&(pairs.len() as u16).to_be_bytes());
            for (clear, encrypted) in pairs {
                senc.extend_from_slice(&clear.to_be_bytes());
                senc.extend_from_slice(&encrypted.to_be_bytes());
            }
        }
    }
    let senc = full_box(b"senc", 0, if with_subsamples { 0x2 } else { 0 }, &senc);

    let moof = |data_offset: i32| {
        let mut trun = (samples.len() as u32).to_be_bytes().to_vec();
        trun.extend_from_slice(&data_offset.to_be_bytes());
        for sample in samples {
            trun.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
        }
        let traf = [
            full_box(b"tfhd", 0, 0x02_0000, &1u32.to_be_bytes()),
            full_box(b"trun", 0, 0x201, &trun),
            senc.clone(),
        ]
        .concat();
        mp4_box(
            b"moof",
            &[full_box(b"mfhd", 0, 0, &1u32.to_be_bytes()), mp4_box(b"traf", &traf)].concat(),
        )
    };

    let size = moof(0).len();
    let mdat: Vec<u8> = samples.iter().flat_map(|s| s.data.iter().copied()).collect();
    [moof(size as i32 + 8), mp4_box(b"mdat", &mdat)].concat()
}
