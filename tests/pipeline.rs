mod common;

use std::sync::{Arc, Mutex};

use common::*;
use rsmusicdl::config::PipelineConfig;
use rsmusicdl::decrypt::CounterPolicy;
use rsmusicdl::error::{DecryptionError, Error, LicenseError};
use rsmusicdl::key::KeyId;
use rsmusicdl::license::LicenseClient;
use rsmusicdl::mux::FileMuxer;
use rsmusicdl::pipeline::{CancelToken, KeySource, Pipeline, PipelineState};

const KID: KeyId = KeyId::from_bytes([
    0x6f, 0x12, 0x3a, 0x8e, 0x41, 0xd0, 0x4c, 0x55, 0x9b, 0x07, 0xe2, 0x33, 0xaa, 0x19, 0x80, 0x4d,
]);

fn license_source(server: &FakeLicenseServer) -> KeySource {
    KeySource::License(LicenseClient::new(credential(), server.clone()).with_max_attempts(3))
}

fn assert_plaintext(output: &[u8], plain: &[Vec<FixtureSample>]) {
    for sample in plain.iter().flatten() {
        assert!(contains(output, &sample.data), "missing decrypted sample");
    }
    assert!(!contains(output, b"senc"));
    assert!(!contains(output, b"enca"));
    assert!(!contains(output, b"pssh"));
    assert!(contains(output, b"mp4a"));
}

#[test]
fn unencrypted_stream_needs_no_license() {
    let init = [mp4_box(b"ftyp", b"M4A \0\0\0\0"), mp4_box(b"moov", &[])].concat();
    let segments = vec![
        [mp4_box(b"moof", &[]), mp4_box(b"mdat", b"first")].concat(),
        [mp4_box(b"moof", &[]), mp4_box(b"mdat", b"second")].concat(),
    ];
    let cdn = FakeCdn::new(init.clone(), segments.clone(), "");
    let server = FakeLicenseServer::new(&[], &[]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(license_source(&server));
    let summary = pipeline.run(PLAYLIST_URL).expect("run");

    assert!(!summary.encrypted);
    assert_eq!(summary.segments, 2);
    assert_eq!(server.request_count(), 0);
    assert!(pipeline.history().contains(&PipelineState::Unencrypted));
    let muxer = pipeline.into_muxer();
    assert!(muxer.finished);
    assert_eq!(muxer.data, [init, segments.concat()].concat());
}

#[test]
fn licensed_stream_is_decrypted() {
    let plain = plain_samples();
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain, &content_key_for(KID), false),
        "",
    );
    let server = FakeLicenseServer::new(&[KID], &[]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(license_source(&server));
    let summary = pipeline.run(PLAYLIST_URL).expect("run");

    assert!(summary.encrypted);
    assert_eq!(summary.segments, 3);
    assert_eq!(summary.samples_decrypted, 6);
    assert_eq!(server.request_count(), 1);
    assert_eq!(
        pipeline.history(),
        &[
            PipelineState::Init,
            PipelineState::ManifestResolved,
            PipelineState::KeysAcquiring,
            PipelineState::KeysAcquired,
            PipelineState::Streaming,
            PipelineState::Done,
        ]
    );
    let muxer = pipeline.into_muxer();
    assert!(muxer.finished);
    assert_eq!(muxer.writes, 4);
    assert_plaintext(&muxer.data, &plain);
}

#[test]
fn widevine_key_tag_is_used_for_the_license() {
    let plain = plain_samples();
    let pssh = base64_pssh(KID);
    let key_line = format!(
        "#EXT-X-KEY:METHOD=SAMPLE-AES-CTR,URI=\"data:text/plain;base64,{}\",KEYFORMAT=\"urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed\",KEYFORMATVERSIONS=\"1\"\n",
        pssh
    );
    let cdn = FakeCdn::new(
        encrypted_init(KID, false),
        encrypt_stream(&plain, &content_key_for(KID), false),
        &key_line,
    );
    let server = FakeLicenseServer::new(&[KID], &[]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(license_source(&server));
    pipeline.run(PLAYLIST_URL).expect("run");
    assert_plaintext(&pipeline.into_muxer().data, &plain);
}

fn base64_pssh(kid: KeyId) -> String {
    rsmusicdl::pssh::Pssh::from_key_ids(&[kid])
        .expect("pssh")
        .to_base64()
}

#[test]
fn bad_license_signature_fails_before_media() {
    let plain = plain_samples();
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain, &content_key_for(KID), false),
        "",
    );
    let server = FakeLicenseServer::new(&[KID], &[Reply::BadSignature]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(license_source(&server));
    let err = pipeline.run(PLAYLIST_URL).expect_err("tampered license");

    assert!(matches!(err, Error::License(LicenseError::SignatureMismatch(_))));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(server.request_count(), 1);
    assert_eq!(cdn.segment_fetches(), 0);
    assert!(!pipeline.has_key_source());
    let muxer = pipeline.into_muxer();
    assert!(!muxer.finished);
    assert!(muxer.data.is_empty());
}

#[test]
fn unavailable_license_server_is_retried_with_fresh_requests() {
    let plain = plain_samples();
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain, &content_key_for(KID), false),
        "",
    );
    let server = FakeLicenseServer::new(&[KID], &[Reply::Unavailable, Reply::Unavailable]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(license_source(&server));
    pipeline.run(PLAYLIST_URL).expect("third attempt succeeds");

    let ids = server.request_ids();
    assert_eq!(ids.len(), 3);
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    assert_plaintext(&pipeline.into_muxer().data, &plain);
}

#[test]
fn retries_give_up_after_max_attempts() {
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain_samples(), &content_key_for(KID), false),
        "",
    );
    let server = FakeLicenseServer::new(&[KID], &[Reply::Unavailable; 5]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(license_source(&server));
    let err = pipeline.run(PLAYLIST_URL).expect_err("server stays down");

    assert!(matches!(err, Error::License(LicenseError::Network(_))));
    assert_eq!(server.request_count(), 3);
    assert_eq!(pipeline.state(), PipelineState::Failed);
}

#[test]
fn manual_key_skips_the_license_server() {
    let plain = plain_samples();
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain, &content_key_for(KID), false),
        "",
    );
    let config = PipelineConfig::default();

    let mut pipeline = Pipeline::new(config.clone(), &cdn, RecordingMuxer::default())
        .with_key_source(KeySource::manual(content_key_for(KID), &config));
    pipeline.run(PLAYLIST_URL).expect("run");

    assert!(!pipeline.history().contains(&PipelineState::KeysAcquiring));
    assert_plaintext(&pipeline.into_muxer().data, &plain);
}

#[test]
fn continuous_counter_policy() {
    let plain = plain_samples();
    let key = content_key_for(KID);
    let config = PipelineConfig {
        counter_policy: CounterPolicy::Continuous,
        ..Default::default()
    };

    let cdn = FakeCdn::new(encrypted_init(KID, true), encrypt_stream(&plain, &key, true), "");
    let mut pipeline = Pipeline::new(config.clone(), &cdn, RecordingMuxer::default())
        .with_key_source(KeySource::manual(key.clone(), &config));
    pipeline.run(PLAYLIST_URL).expect("run");
    assert_plaintext(&pipeline.into_muxer().data, &plain);

    // the same stream under per-segment counters is garbled
    let cdn = FakeCdn::new(encrypted_init(KID, true), encrypt_stream(&plain, &key, true), "");
    let defaults = PipelineConfig::default();
    let mut pipeline = Pipeline::new(defaults.clone(), &cdn, RecordingMuxer::default())
        .with_key_source(KeySource::manual(key, &defaults));
    pipeline.run(PLAYLIST_URL).expect("run");
    let output = pipeline.into_muxer().data;
    assert!(!plain[1..]
        .iter()
        .flatten()
        .all(|sample| contains(&output, &sample.data)));
}

#[test]
fn parallel_and_sequential_output_match() {
    let plain = plain_samples();
    let key = content_key_for(KID);
    let run = |parallel_decrypt: bool| {
        let config = PipelineConfig {
            parallel_decrypt,
            ..Default::default()
        };
        let cdn = FakeCdn::new(encrypted_init(KID, true), encrypt_stream(&plain, &key, false), "");
        let mut pipeline = Pipeline::new(config.clone(), &cdn, RecordingMuxer::default())
            .with_key_source(KeySource::manual(key.clone(), &config));
        pipeline.run(PLAYLIST_URL).expect("run");
        pipeline.into_muxer().data
    };

    let parallel = run(true);
    assert_eq!(parallel, run(false));
    assert_plaintext(&parallel, &plain);
}

#[test]
fn cancellation_stops_between_segments() {
    let token = CancelToken::new();
    // playlist, init and the first segment are served before the flag trips
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain_samples(), &content_key_for(KID), false),
        "",
    )
    .cancel_after(3, token.clone());
    let config = PipelineConfig::default();

    let mut pipeline = Pipeline::new(config.clone(), &cdn, RecordingMuxer::default())
        .with_key_source(KeySource::manual(content_key_for(KID), &config))
        .with_cancel_token(token);
    let err = pipeline.run(PLAYLIST_URL).expect_err("cancelled");

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(cdn.segment_fetches(), 1);
    assert!(!pipeline.into_muxer().finished);
}

#[test]
fn cancelled_before_start_fetches_nothing() {
    let cdn = FakeCdn::new(encrypted_init(KID, true), vec![], "");
    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default());
    pipeline.cancel_token().cancel();

    assert!(matches!(pipeline.run(PLAYLIST_URL), Err(Error::Cancelled)));
    assert!(cdn.log().is_empty());
}

#[test]
fn file_output_is_written_atomically() {
    let plain = plain_samples();
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("track.m4a");
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain, &content_key_for(KID), false),
        "",
    );
    let server = FakeLicenseServer::new(&[KID], &[]);

    let muxer = FileMuxer::create(&out).expect("create");
    let mut pipeline =
        Pipeline::new(PipelineConfig::default(), &cdn, muxer).with_key_source(license_source(&server));
    let summary = pipeline.run(PLAYLIST_URL).expect("run");
    drop(pipeline);

    let written = std::fs::read(&out).expect("read output");
    assert_eq!(written.len() as u64, summary.bytes_written);
    assert_plaintext(&written, &plain);
    assert!(!dir.path().join("track.m4a.part").exists());
}

#[test]
fn failed_download_leaves_no_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("track.m4a");
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain_samples(), &content_key_for(KID), false),
        "",
    );
    let server = FakeLicenseServer::new(&[KID], &[Reply::BadSignature]);

    let muxer = FileMuxer::create(&out).expect("create");
    let mut pipeline =
        Pipeline::new(PipelineConfig::default(), &cdn, muxer).with_key_source(license_source(&server));
    assert!(pipeline.run(PLAYLIST_URL).is_err());
    drop(pipeline);

    assert!(!out.exists());
    assert!(!dir.path().join("track.m4a.part").exists());
}

#[test]
fn license_without_the_track_key_fails_before_media() {
    let other = KeyId::from_bytes([0x42; 16]);
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain_samples(), &content_key_for(KID), false),
        "",
    );
    let server = FakeLicenseServer::new(&[other], &[]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(license_source(&server));
    let err = pipeline.run(PLAYLIST_URL).expect_err("no key for the track");

    assert!(matches!(
        err,
        Error::Decryption(DecryptionError::MissingKey(kid)) if kid == KID
    ));
    assert_eq!(server.request_count(), 1);
    assert_eq!(cdn.segment_fetches(), 0);
    assert!(!pipeline.history().contains(&PipelineState::Streaming));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    let muxer = pipeline.into_muxer();
    assert!(muxer.data.is_empty());
    assert!(!muxer.finished);
}

fn private_license_source(server: &FakeLicenseServer) -> KeySource {
    KeySource::License(LicenseClient::new(credential(), server.clone()).with_privacy_mode(true))
}

#[test]
fn privacy_mode_contacts_nobody_for_clear_streams() {
    let init = [mp4_box(b"ftyp", b"M4A \0\0\0\0"), mp4_box(b"moov", &[])].concat();
    let cdn = FakeCdn::new(init, vec![mp4_box(b"mdat", b"clear")], "");
    let server = FakeLicenseServer::new(&[KID], &[]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(private_license_source(&server));
    pipeline.run(PLAYLIST_URL).expect("run");

    assert_eq!(server.certificate_requests(), 0);
    assert_eq!(server.request_count(), 0);
}

#[test]
fn privacy_mode_encrypts_the_client_id() {
    let plain = plain_samples();
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain, &content_key_for(KID), false),
        "",
    );
    let server = FakeLicenseServer::new(&[KID], &[]);

    let mut pipeline = Pipeline::new(PipelineConfig::default(), &cdn, RecordingMuxer::default())
        .with_key_source(private_license_source(&server));
    pipeline.run(PLAYLIST_URL).expect("run");

    assert_eq!(server.certificate_requests(), 1);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].client_id.is_none());
    let encrypted = requests[0].encrypted_client_id.as_ref().expect("encrypted client id");
    assert_eq!(encrypted.provider_id.as_deref(), Some("license.widevine.com"));
    assert_plaintext(&pipeline.into_muxer().data, &plain);
}

#[test]
fn progress_is_reported_per_segment() {
    let plain = plain_samples();
    let cdn = FakeCdn::new(
        encrypted_init(KID, true),
        encrypt_stream(&plain, &content_key_for(KID), false),
        "",
    );
    let config = PipelineConfig::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut pipeline = Pipeline::new(config.clone(), &cdn, RecordingMuxer::default())
        .with_key_source(KeySource::manual(content_key_for(KID), &config))
        .with_progress(move |progress| sink.lock().expect("lock").push(progress));
    let summary = pipeline.run(PLAYLIST_URL).expect("run");

    let seen = seen.lock().expect("lock");
    let done: Vec<usize> = seen.iter().map(|p| p.done).collect();
    assert_eq!(done, vec![0, 1, 2, 3]);
    assert!(seen.iter().all(|p| p.total == 3));
    assert_eq!(seen.last().map(|p| p.bytes_written), Some(summary.bytes_written));
}
