//! Download pipeline.
//!
//! A [`Pipeline`] resolves a media playlist, obtains the content keys (from a
//! license server or a manually supplied key), then streams every segment
//! through decryption into a [`Muxer`]. Progress is tracked as an explicit
//! [`PipelineState`]; every failure ends in [`PipelineState::Failed`] with a
//! single consolidated [`Error`].
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::decrypt::{decrypt_parallel, CounterPolicy, EncryptedSegment, SegmentDecryptor};
use crate::device::DeviceCredential;
use crate::error::{DecryptionError, Error, Result};
use crate::fetch::Fetcher;
use crate::fmp4::{self, TrackEncryption};
use crate::hls::MediaManifest;
use crate::key::{ContentKey, ContentKeyTable, KeyId};
use crate::license::{HttpTransport, LicenseClient};
use crate::mux::Muxer;
use crate::protection::{self, Protection, ProtectionHeader};

/// Where a [`Pipeline`] is in its single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Init,
    ManifestResolved,
    Unencrypted,
    KeysAcquiring,
    KeysAcquired,
    Streaming,
    Done,
    Failed,
}

impl PipelineState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PipelineState::Init => "Init",
            PipelineState::ManifestResolved => "ManifestResolved",
            PipelineState::Unencrypted => "Unencrypted",
            PipelineState::KeysAcquiring => "KeysAcquiring",
            PipelineState::KeysAcquired => "KeysAcquired",
            PipelineState::Streaming => "Streaming",
            PipelineState::Done => "Done",
            PipelineState::Failed => "Failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// `Failed` is reachable from every non-terminal state. The manual-key
    /// path goes from `ManifestResolved` straight to `KeysAcquired`.
    #[must_use]
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Init, ManifestResolved)
                | (ManifestResolved, Unencrypted)
                | (ManifestResolved, KeysAcquiring)
                | (ManifestResolved, KeysAcquired)
                | (KeysAcquiring, KeysAcquired)
                | (Unencrypted, Streaming)
                | (KeysAcquired, Streaming)
                | (Streaming, Done)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do with a manual key when the stream declares no key id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnboundKeyPolicy {
    #[default]
    Reject,
    /// Use the key for every sample.
    AcceptAny,
}

/// Where content keys come from.
#[derive(Debug)]
pub enum KeySource {
    License(LicenseClient),
    Manual {
        key: ContentKey,
        unbound: UnboundKeyPolicy,
    },
}

impl KeySource {
    /// A license-backed source configured from `config`.
    ///
    /// Nothing is sent until keys are needed. In privacy mode the service
    /// certificate is requested right before the first license request.
    pub fn license(credential: DeviceCredential, config: &PipelineConfig) -> Result<Self> {
        let transport = HttpTransport::new(
            config.license_timeout(),
            config.origin.as_deref(),
            config.user_agent.as_deref(),
        )?;
        let client = LicenseClient::new(credential, transport)
            .with_license_url(config.license_url())
            .with_max_attempts(config.max_license_attempts)
            .with_privacy_mode(config.privacy_mode);
        Ok(KeySource::License(client))
    }

    /// A manual source honoring the config's unbound-key setting.
    #[must_use]
    pub fn manual(key: ContentKey, config: &PipelineConfig) -> Self {
        let unbound = if config.accept_unbound_manual_key {
            UnboundKeyPolicy::AcceptAny
        } else {
            UnboundKeyPolicy::Reject
        };
        KeySource::Manual { key, unbound }
    }
}

/// Shared cancellation flag, checked before every fetch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A playlist with its init segment and the protection they declare.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub manifest: MediaManifest,
    pub init: Vec<u8>,
    pub track: Option<TrackEncryption>,
    pub protection: Protection,
}

impl ResolvedStream {
    /// Combine a parsed playlist with its init segment.
    ///
    /// Key tags in the playlist take precedence; otherwise the init segment's
    /// `pssh`/`tenc` boxes decide.
    pub fn new(manifest: MediaManifest, init: Vec<u8>) -> Result<Self> {
        let track = TrackEncryption::from_init(&init)?;
        let protection = match manifest.protection()? {
            Protection::Unprotected => protection::from_mp4(&init)?,
            protected => protected,
        };
        Ok(Self {
            manifest,
            init,
            track,
            protection,
        })
    }

    /// Key id the stream declares: the playlist `KEYID`, else the header's
    /// first KID, else the track's default KID.
    #[must_use]
    pub fn declared_key_id(&self) -> Option<KeyId> {
        let real = |kid: &KeyId| *kid != KeyId::NIL;
        self.manifest
            .declared_key_id()
            .filter(real)
            .or_else(|| {
                self.protection
                    .header()
                    .and_then(ProtectionHeader::first_key_id)
                    .filter(real)
            })
            .or_else(|| self.track.as_ref().map(|t| t.default_kid).filter(real))
    }
}

/// Outcome of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub encrypted: bool,
    pub segments: usize,
    pub samples_decrypted: usize,
    pub bytes_written: u64,
}

/// Segment progress reported while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentProgress {
    /// Segments written so far; 0 right after the init segment.
    pub done: usize,
    pub total: usize,
    pub bytes_written: u64,
}

type ProgressFn = Box<dyn FnMut(SegmentProgress) + Send>;

/// One download: playlist in, clear media out through a [`Muxer`].
pub struct Pipeline<F, M> {
    config: PipelineConfig,
    fetcher: F,
    muxer: M,
    key_source: Option<KeySource>,
    cancel: CancelToken,
    progress: Option<ProgressFn>,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl<F, M> fmt::Debug for Pipeline<F, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state)
            .field("key_source", &self.key_source.is_some())
            .finish_non_exhaustive()
    }
}

impl<F: Fetcher, M: Muxer> Pipeline<F, M> {
    pub fn new(config: PipelineConfig, fetcher: F, muxer: M) -> Self {
        Self {
            config,
            fetcher,
            muxer,
            key_source: None,
            cancel: CancelToken::new(),
            progress: None,
            state: PipelineState::Init,
            history: vec![PipelineState::Init],
        }
    }

    #[must_use]
    pub fn with_key_source(mut self, source: KeySource) -> Self {
        self.key_source = Some(source);
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Call `report` once the init segment is written and after every media
    /// segment.
    #[must_use]
    pub fn with_progress(
        mut self,
        report: impl FnMut(SegmentProgress) + Send + 'static,
    ) -> Self {
        self.progress = Some(Box::new(report));
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, starting with `Init`.
    #[must_use]
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    #[must_use]
    pub fn has_key_source(&self) -> bool {
        self.key_source.is_some()
    }

    pub fn into_muxer(self) -> M {
        self.muxer
    }

    /// Download, decrypt and mux the stream behind `manifest_url`.
    ///
    /// A pipeline runs once. On failure the key source is dropped, the muxer
    /// is left unfinished and the state is `Failed`.
    pub fn run(&mut self, manifest_url: &str) -> Result<DownloadSummary> {
        if self.state != PipelineState::Init {
            return Err(Error::InvalidTransition {
                from: self.state.name(),
                to: PipelineState::ManifestResolved.name(),
            });
        }

        match self.execute(manifest_url) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                error!("Download failed in state {}: {}", self.state, err);
                self.key_source = None;
                self.state = PipelineState::Failed;
                self.history.push(PipelineState::Failed);
                Err(err)
            }
        }
    }

    fn execute(&mut self, manifest_url: &str) -> Result<DownloadSummary> {
        let stream = self.resolve(manifest_url)?;
        info!(
            "Resolved {} segment(s), {}",
            stream.manifest.segment_uris.len(),
            if stream.protection.is_protected() { "encrypted" } else { "clear" }
        );

        let declared = stream.declared_key_id();
        let total = stream.manifest.segment_uris.len();
        let ResolvedStream {
            manifest,
            mut init,
            track,
            protection,
        } = stream;

        let keys = match (&protection, &track) {
            (Protection::Unprotected, _) => {
                self.transition(PipelineState::Unencrypted)?;
                None
            }
            (Protection::Protected(_), None) => {
                return Err(Error::MalformedHeader(
                    "Stream is protected but the init segment has no tenc box".to_string(),
                ))
            }
            (Protection::Protected(header), Some(track)) => {
                track.ensure_supported()?;
                Some(self.acquire_keys(header, declared, track.default_kid)?)
            }
        };

        self.transition(PipelineState::Streaming)?;
        let policy = self.config.counter_policy;
        let parallel = self.config.parallel_decrypt && policy == CounterPolicy::PerSegment;
        if self.config.parallel_decrypt && !parallel {
            debug!("Continuous counter policy; decrypting sequentially");
        }

        let mut summary = DownloadSummary {
            encrypted: keys.is_some(),
            segments: 0,
            samples_decrypted: 0,
            bytes_written: 0,
        };

        if keys.is_some() {
            fmp4::clear_init(&mut init)?;
        }
        self.muxer.write(&init)?;
        summary.bytes_written += init.len() as u64;
        self.report(&summary, total);

        let mut decryptor = keys.as_ref().map(|k| SegmentDecryptor::new(k, policy));
        for (index, uri) in manifest.segment_uris.iter().enumerate() {
            self.check_cancelled()?;
            let mut fragment = self.fetcher.fetch(uri)?;

            if let (Some(track), Some(keys), Some(decryptor)) = (&track, &keys, decryptor.as_mut()) {
                summary.samples_decrypted +=
                    decrypt_fragment(&mut fragment, track, keys, decryptor, parallel)?;
                fmp4::clear_fragment(&mut fragment)?;
            }

            self.muxer.write(&fragment)?;
            summary.bytes_written += fragment.len() as u64;
            summary.segments += 1;
            trace!("Segment {}/{} done", index + 1, total);
            self.report(&summary, total);
        }

        self.muxer.finish()?;
        self.transition(PipelineState::Done)?;
        info!(
            "Wrote {} segment(s), {} bytes",
            summary.segments, summary.bytes_written
        );
        Ok(summary)
    }

    fn resolve(&mut self, manifest_url: &str) -> Result<ResolvedStream> {
        self.check_cancelled()?;
        let data = self.fetcher.fetch(manifest_url)?;
        let manifest = MediaManifest::parse(&data, manifest_url)?;
        self.transition(PipelineState::ManifestResolved)?;

        self.check_cancelled()?;
        let init = self.fetcher.fetch(&manifest.init_uri)?;
        ResolvedStream::new(manifest, init)
    }

    fn report(&mut self, summary: &DownloadSummary, total: usize) {
        if let Some(report) = self.progress.as_mut() {
            report(SegmentProgress {
                done: summary.segments,
                total,
                bytes_written: summary.bytes_written,
            });
        }
    }

    /// Obtain the key table. Fails unless it holds the key the samples are
    /// encrypted under (`sample_kid`) and the declared key.
    fn acquire_keys(
        &mut self,
        header: &ProtectionHeader,
        declared: Option<KeyId>,
        sample_kid: KeyId,
    ) -> Result<ContentKeyTable> {
        let source = self.key_source.take().ok_or_else(|| {
            Error::Config("Stream is encrypted but no key source was configured".to_string())
        })?;

        let table = match source {
            KeySource::Manual { key, unbound } => {
                let table = match (declared, unbound) {
                    (Some(kid), _) => ContentKeyTable::single(kid, key),
                    (None, UnboundKeyPolicy::AcceptAny) => {
                        warn!("Stream declares no key id; using the manual key for every sample");
                        ContentKeyTable::unbound(key)
                    }
                    (None, UnboundKeyPolicy::Reject) => {
                        return Err(Error::MalformedHeader(
                            "Stream declares no key id for the manual key".to_string(),
                        ))
                    }
                };
                self.transition(PipelineState::KeysAcquired)?;
                table
            }
            KeySource::License(mut client) => {
                self.transition(PipelineState::KeysAcquiring)?;
                self.check_cancelled()?;
                client.prepare_privacy()?;
                let table = client.acquire(header)?;
                self.transition(PipelineState::KeysAcquired)?;
                table
            }
        };

        for kid in std::iter::once(sample_kid).chain(declared) {
            if !table.contains(&kid) {
                return Err(DecryptionError::MissingKey(kid).into());
            }
        }
        Ok(table)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn transition(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        debug!("Pipeline {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

/// Decrypt every sample of `fragment` in place. Returns the sample count.
fn decrypt_fragment(
    fragment: &mut [u8],
    track: &TrackEncryption,
    keys: &ContentKeyTable,
    decryptor: &mut SegmentDecryptor<'_>,
    parallel: bool,
) -> Result<usize> {
    let samples = fmp4::parse_fragment(fragment, track)?;
    let count = samples.len();

    if parallel {
        let (positions, segments): (Vec<usize>, Vec<EncryptedSegment>) =
            samples.into_iter().map(|s| (s.position, s.segment)).unzip();
        for (position, plain) in positions.into_iter().zip(decrypt_parallel(&segments, keys)?) {
            fragment[position..position + plain.len()].copy_from_slice(&plain);
        }
    } else {
        for sample in samples {
            let plain = decryptor.decrypt_to_vec(sample.segment)?;
            fragment[sample.position..sample.position + plain.len()].copy_from_slice(&plain);
        }
    }
    Ok(count)
}
