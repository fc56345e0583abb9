//! Widevine license client.
//!
//! This module handles license request building and signing, the transport
//! call, response verification and key unwrapping, and privacy (service)
//! certificate handling.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aes::Aes128;
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use prost::Message;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::rand_core::{OsRng, RngCore};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;

use crate::device::DeviceCredential;
use crate::error::LicenseError;
use crate::key::{ContentKeyTable, Key};
use crate::license_protocol::license_request::content_identification::{
    ContentIdVariant, WidevinePsshData as WidevinePsshDataRequest,
};
use crate::license_protocol::license_request::{ContentIdentification, RequestType};
use crate::license_protocol::signed_message::MessageType;
use crate::license_protocol::{
    license_error, ClientIdentification, DrmCertificate, EncryptedClientIdentification, License,
    LicenseError as LicenseErrorMessage, LicenseRequest, LicenseType, ProtocolVersion,
    SignedDrmCertificate, SignedMessage,
};
use crate::protection::ProtectionHeader;
use crate::session::{RequestNonce, SessionState};

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Result<T> = std::result::Result<T, LicenseError>;

/// License server used when neither the stream nor the config names one.
pub const DEFAULT_LICENSE_URL: &str = "https://stream.udio.com/drm/license?type=widevine";
/// Service certificate challenge payload.
pub const SERVICE_CERTIFICATE_CHALLENGE: &[u8] = b"\x08\x04";
/// Default number of attempts for retryable license failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default timeout for one license round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Widevine common privacy certificate (license.widevine.com).
pub const COMMON_PRIVACY_CERT: &str = concat!(
    "CAUSxwUKwQIIAxIQFwW5F8wSBIaLBjM6L3cqjBiCtIKSBSKOAjCCAQoCggEBAJntWzsy",
    "fateJO/DtiqVtZhSCtW8yzdQPgZFuBTYdrjfQFEEQa2M462xG7iMTnJaXkqeB5Up",
    "HVhYQCOn4a8OOKkSeTkwCGELbxWMh4x+Ib/7/up34QGeHleB6KRfRiY9FOYOgFioY",
    "Hrc4E+shFexN6jWfM3rM3BdmDoh+07svUoQykdJDKR+ql1DghjduvHK3jOS8T1v+",
    "2RC/THhv0CwxgTRxLpMlSCkv5fuvWCSmvzu9Vu69WTi0Ods18Vcc6CCuZYSC4NZ7",
    "c4kcHCCaA1vZ8bYLErF8xNEkKdO7DevSy8BDFnoKEPiWC8La59dsPxebt9k+9MI",
    "tHEbzxJQAZyfWgkCAwEAAToUbGljZW5zZS53aWRldmluZS5jb20SgAOuNHMUtag1",
    "KX8nE4j7e7jLUnfSSYI83dHaMLkzOVEes8y96gS5RLknwSE0bv296snUE5F+bsF2",
    "oQQ4RgpQO8GVK5uk5M4PxL/CCpgIqq9L/NGcHc/N9XTMrCjRtBBBbPneiAQwHL2z",
    "NMr80NQJeEI6ZC5UYT3wr8+WykqSSdhV5Cs6cD7xdn9qm9Nta/gr52u/DLpP3lnS",
    "q8x2/rZCR7hcQx+8pSJmthn8NpeVQ/ypy727+voOGlXnVaPHvOZV+WRvWCq5z3Cq",
    "CLl5+Gf2Ogsrf9s2LFvE7NVV2FvKqcWTw4PIV9Sdqrd+QLeFHd/SSZiAjjWyWOdd",
    "eOrAyhb3BHMEwg2T7eTo/xxvF+YkPj89qPwXCYcOxF+6gjomPwzvofcJOxkJkoMm",
    "MzcFBDopvab5tDQsyN9UPLGhGC98X/8z8QSQ+spbJTYLdgFenFoGq47gLwDS6NWY",
    "YQSqzE3Udf2W7pzk4ybyG4PHBYV3s4cyzdq8amvtE/sNSdOKReuHpfQ="
);

const ROOT_SIGNED_CERT_B64: &str = concat!(
    "CpwDCAASAQAY3ZSIiwUijgMwggGKAoIBgQC0/jnDZZAD2zwRlwnoaM3yw16b8ud",
    "NI7EQ24dl39z7nzWgVwNTTPZtNX2meNuzNtI/nECplSZyf7i+Zt/FIZh4FRZoXS9",
    "GDkPLioQ5q/uwNYAivjQji6tTW3LsS7VIaVM+R1/9Cf2ndhOPD5LWTN+udqm62SI",
    "QqZ1xRdbX4RklhZxTmpfrhNfMqIiCIHAmIP1+QFAn4iWTb7w+cqD6wb0ptE2CXMG",
    "0y5xyfrDpihc+GWP8/YJIK7eyM7l97Eu6iR8nuJuISISqGJIOZfXIbBH/azbkdDT",
    "KjDOx+biOtOYS4AKYeVJeRTP/Edzrw1O6fGAaET0A+9K3qjD6T15Id1sX3HXvb9I",
    "Zbdy+f7B4j9yCYEy/5CkGXmmMOROtFCXtGbLynwGCDVZEiMg17B8RsyTgWQ035Ec",
    "86kt/lzEcgXyUikx9aBWE/6UI/Rjn5yvkRycSEbgj7FiTPKwS0ohtQT3F/hzcufj",
    "UUT4H5QNvpxLoEve1zqaWVT94tGSCUNIzX5ECAwEAARKAA1jx1k0ECXvf1+9dOwI",
    "5F/oUNnVKOGeFVxKnFO41FtU9v0KG9mkAds2T9Hyy355EzUzUrgkYU0Qy7OBhG+X",
    "aE9NVxd0ay5AeflvG6Q8in76FAv6QMcxrA4S9IsRV+vXyCM1lQVjofSnaBFiC9Td",
    "pvPNaV4QXezKHcLKwdpyywxXRESYqI3WZPrl3IjINvBoZwdVlkHZVdA8OaU1fTY8",
    "Zr9/WFjGUqJJfT7x6Mfiujq0zt+kw0IwKimyDNfiKgbL+HIisKmbF/73mF9BiC9",
    "yKRfewPlrIHkokL2yl4xyIFIPVxe9enz2FRXPia1BSV0z7kmxmdYrWDRuu8+yvUS",
    "IDXQouY5OcCwEgqKmELhfKrnPsIht5rvagcizfB0fbiIYwFHghESKIrNdUdPnzJs",
    "KlVshWTwApHQh7evuVicPumFSePGuUBRMS9nG5qxPDDJtGCHs9Mmpoyh6ckGLF7R",
    "C5HxclzpC5bc3ERvWjYhN0AqdipPpV2d7PouaAdFUGSdUCDA=="
);

/// Blocking transport to a license server.
pub trait LicenseTransport: Send + Sync {
    /// POST `body` to `url` and return the raw response body.
    fn post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>>;
}

/// `reqwest` transport with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a transport with the given timeout and optional extra headers.
    pub fn new(
        timeout: Duration,
        origin: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(origin) = origin {
            let value = reqwest::header::HeaderValue::from_str(origin)
                .map_err(|e| LicenseError::Network(format!("Invalid Origin header: {}", e)))?;
            headers.insert(reqwest::header::ORIGIN, value.clone());
            headers.insert(reqwest::header::REFERER, value);
        }

        let mut builder = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .default_headers(headers);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }

        let client = builder
            .build()
            .map_err(|e| LicenseError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl LicenseTransport for HttpTransport {
    fn post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body.to_vec())
            .send()
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LicenseError::Network(format!(
                "License server returned {}",
                status
            )));
        }
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(LicenseError::Denied(format!("HTTP {}: {}", status, detail.trim())));
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> LicenseError {
    if err.is_timeout() {
        LicenseError::Timeout
    } else {
        LicenseError::Network(err.to_string())
    }
}

/// An unsigned license request with its fresh nonce.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    request: LicenseRequest,
    nonce: RequestNonce,
    license_url: String,
}

impl PendingRequest {
    /// The license request message, before signing.
    #[must_use]
    pub fn request(&self) -> &LicenseRequest {
        &self.request
    }

    /// Nonce carried by this request only.
    #[must_use]
    pub fn nonce(&self) -> &RequestNonce {
        &self.nonce
    }

    /// Where the request will be posted.
    #[must_use]
    pub fn license_url(&self) -> &str {
        &self.license_url
    }
}

/// A signed request ready to be sent exactly once.
#[derive(Debug)]
pub struct SignedRequest {
    body: Vec<u8>,
    license_url: String,
    session: SessionState,
}

impl SignedRequest {
    /// The exact bytes that go on the wire.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Request id the license response must echo.
    #[must_use]
    pub fn request_id(&self) -> &[u8] {
        self.session.request_id()
    }
}

/// Verified license: the unwrapped session key and every key it carried.
#[derive(Clone)]
pub struct LicenseResponse {
    pub session_key: Vec<u8>,
    pub keys: Vec<Key>,
    table: ContentKeyTable,
}

impl LicenseResponse {
    /// CONTENT keys of this license.
    #[must_use]
    pub fn content_keys(&self) -> &ContentKeyTable {
        &self.table
    }

    #[must_use]
    pub fn into_content_keys(self) -> ContentKeyTable {
        self.table
    }
}

impl std::fmt::Debug for LicenseResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseResponse")
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

/// License client bound to one device credential.
pub struct LicenseClient {
    credential: DeviceCredential,
    transport: Box<dyn LicenseTransport>,
    license_url: String,
    service_certificate: Option<SignedDrmCertificate>,
    privacy_mode: bool,
    max_attempts: u32,
    request_counter: AtomicU64,
}

impl std::fmt::Debug for LicenseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseClient")
            .field("system_id", &self.credential.system_id)
            .field("license_url", &self.license_url)
            .field("privacy_mode", &self.privacy_mode)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl LicenseClient {
    /// Create a client using the default license URL and attempt budget.
    pub fn new(credential: DeviceCredential, transport: impl LicenseTransport + 'static) -> Self {
        Self {
            credential,
            transport: Box::new(transport),
            license_url: DEFAULT_LICENSE_URL.to_string(),
            service_certificate: None,
            privacy_mode: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_counter: AtomicU64::new(0),
        }
    }

    /// License URL used when the protection header does not name one.
    #[must_use]
    pub fn with_license_url(mut self, url: impl Into<String>) -> Self {
        self.license_url = url.into();
        self
    }

    /// Number of attempts for retryable failures. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Encrypt the client id once a service certificate is available.
    #[must_use]
    pub fn with_privacy_mode(mut self, enabled: bool) -> Self {
        self.privacy_mode = enabled;
        self
    }

    #[must_use]
    pub fn credential(&self) -> &DeviceCredential {
        &self.credential
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Set the service certificate used for privacy mode.
    ///
    /// The certificate must be either a serialized `SignedDrmCertificate` or a
    /// serialized `SignedMessage` containing one, and must be signed by the
    /// Widevine root. Returns the provider id.
    pub fn set_service_certificate(&mut self, certificate: &[u8]) -> Result<Option<String>> {
        let signed = decode_signed_drm_certificate(certificate)?;
        let drm_certificate = decode_drm_certificate(&signed)?;
        verify_signed_certificate(&signed, &root_public_key()?)?;

        debug!(
            "Service certificate set for provider {}",
            drm_certificate.provider_id.as_deref().unwrap_or("<unknown>")
        );
        self.service_certificate = Some(signed);
        self.privacy_mode = true;
        Ok(drm_certificate.provider_id)
    }

    /// Drop the service certificate, returning to plain client ids.
    pub fn clear_service_certificate(&mut self) -> Option<SignedDrmCertificate> {
        self.service_certificate.take()
    }

    #[must_use]
    pub fn service_certificate(&self) -> Option<&SignedDrmCertificate> {
        self.service_certificate.as_ref()
    }

    /// Ask the license server for its service certificate and install it.
    pub fn fetch_service_certificate(&mut self, url: Option<&str>) -> Result<Option<String>> {
        let url = url.unwrap_or(&self.license_url).to_string();
        let response = self.transport.post(&url, SERVICE_CERTIFICATE_CHALLENGE)?;
        self.set_service_certificate(&response)
    }

    /// Install a service certificate if privacy mode is on and none is set.
    ///
    /// The certificate is requested from the license URL. If that fails the
    /// common privacy certificate is used instead.
    pub fn prepare_privacy(&mut self) -> Result<()> {
        if !self.privacy_mode || self.service_certificate.is_some() {
            return Ok(());
        }
        if let Err(err) = self.fetch_service_certificate(None) {
            warn!("Service certificate request failed ({}); using the common certificate", err);
            self.use_common_privacy_certificate()?;
        }
        Ok(())
    }

    /// Install the Widevine common privacy certificate.
    pub fn use_common_privacy_certificate(&mut self) -> Result<Option<String>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(COMMON_PRIVACY_CERT)
            .map_err(|e| LicenseError::InvalidMessage(format!("Invalid privacy cert: {}", e)))?;
        self.set_service_certificate(&bytes)
    }

    /// Build a fresh, unsigned license request for `header`.
    pub fn build_request(&self, header: &ProtectionHeader) -> Result<PendingRequest> {
        let counter = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = RequestNonce::generate(self.credential.device_type, counter);

        let encrypted_client_id = match (&self.service_certificate, self.privacy_mode) {
            (Some(certificate), true) => Some(encrypt_client_id(
                &self.credential.client_id,
                certificate,
                None,
                None,
            )?),
            _ => None,
        };
        let client_id = if encrypted_client_id.is_some() {
            None
        } else {
            Some(self.credential.client_id.clone())
        };

        let content_id = ContentIdentification {
            content_id_variant: Some(ContentIdVariant::WidevinePsshData(
                WidevinePsshDataRequest {
                    pssh_data: vec![header.init_data.clone()],
                    license_type: Some(LicenseType::Streaming as i32),
                    request_id: Some(nonce.request_id.clone()),
                },
            )),
        };

        let request_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        let request = LicenseRequest {
            client_id,
            content_id: Some(content_id),
            r#type: Some(RequestType::New as i32),
            request_time: Some(request_time),
            key_control_nonce_deprecated: None,
            protocol_version: Some(ProtocolVersion::Version21 as i32),
            key_control_nonce: Some(nonce.key_control_nonce),
            encrypted_client_id,
        };

        let license_url = header
            .license_url
            .clone()
            .unwrap_or_else(|| self.license_url.clone());

        Ok(PendingRequest {
            request,
            nonce,
            license_url,
        })
    }

    /// Serialize the request once and sign exactly those bytes.
    pub fn sign(&self, pending: PendingRequest) -> Result<SignedRequest> {
        let request_bytes = pending.request.encode_to_vec();
        let signature = sign_pss_sha1(&self.credential.private_key, &request_bytes)?;
        let session = SessionState::new(pending.nonce.request_id, &request_bytes);

        let signed_message = SignedMessage {
            r#type: Some(MessageType::LicenseRequest as i32),
            msg: Some(request_bytes),
            signature: Some(signature),
            ..Default::default()
        };

        Ok(SignedRequest {
            body: signed_message.encode_to_vec(),
            license_url: pending.license_url,
            session,
        })
    }

    /// Send a signed request. The request is consumed; its session comes back
    /// for [`LicenseClient::parse_response`].
    pub fn send(&self, signed: SignedRequest) -> Result<(Vec<u8>, SessionState)> {
        debug!("POST license request to {}", signed.license_url);
        let raw = self.transport.post(&signed.license_url, &signed.body)?;
        Ok((raw, signed.session))
    }

    /// Verify a license response and unwrap its keys.
    pub fn parse_response(&self, raw: &[u8], session: SessionState) -> Result<LicenseResponse> {
        let signed_message = SignedMessage::decode(raw).map_err(|e| {
            LicenseError::InvalidMessage(format!("Failed to parse SignedMessage: {}", e))
        })?;

        let msg_bytes = signed_message
            .msg
            .as_ref()
            .ok_or_else(|| LicenseError::InvalidMessage("Missing license message".to_string()))?;

        match signed_message.r#type.and_then(|t| MessageType::try_from(t).ok()) {
            Some(MessageType::License) => {}
            Some(MessageType::ErrorResponse) => {
                return Err(denied_from_error_message(msg_bytes));
            }
            other => {
                return Err(LicenseError::InvalidMessage(format!(
                    "Expected LICENSE message, got {:?}",
                    other
                )));
            }
        }

        let license = License::decode(msg_bytes.as_slice()).map_err(|e| {
            LicenseError::InvalidMessage(format!("Failed to parse License: {}", e))
        })?;

        let request_id = license
            .id
            .as_ref()
            .and_then(|id| id.request_id.as_deref())
            .ok_or_else(|| LicenseError::InvalidContext("Missing request_id".to_string()))?;
        if request_id != session.request_id() {
            return Err(LicenseError::InvalidContext(
                "License does not answer this request".to_string(),
            ));
        }

        let wrapped_session_key = signed_message
            .session_key
            .as_ref()
            .ok_or_else(|| LicenseError::InvalidMessage("Missing session_key".to_string()))?;
        let session_key = self
            .credential
            .private_key
            .decrypt(Oaep::new::<Sha1>(), wrapped_session_key)
            .map_err(|e| LicenseError::Unwrap(format!("Session key: {}", e)))?;

        let derived = session.derive_keys(&session_key)?;

        let mut mac = HmacSha256::new_from_slice(&derived.mac_key_server)
            .map_err(|e| LicenseError::Unwrap(format!("Invalid HMAC key: {}", e)))?;
        if let Some(ref core) = signed_message.oemcrypto_core_message {
            mac.update(core);
        }
        mac.update(msg_bytes);

        let signature = signed_message
            .signature
            .as_ref()
            .ok_or_else(|| LicenseError::InvalidMessage("Missing signature".to_string()))?;
        mac.verify_slice(signature).map_err(|_| {
            LicenseError::SignatureMismatch("Signature mismatch on license message".to_string())
        })?;

        let keys = license
            .key
            .iter()
            .map(|container| Key::from_key_container(container, &derived.enc_key))
            .collect::<Result<Vec<_>>>()?;
        let table = ContentKeyTable::from_license_keys(&keys)?;

        Ok(LicenseResponse {
            session_key,
            keys,
            table,
        })
    }

    /// Run the whole exchange, retrying network failures with fresh requests.
    pub fn acquire(&self, header: &ProtectionHeader) -> Result<ContentKeyTable> {
        let mut attempt = 1;
        loop {
            match self.acquire_once(header) {
                Ok(response) => {
                    info!(
                        "Acquired {} content key(s) on attempt {}",
                        response.content_keys().len(),
                        attempt
                    );
                    return Ok(response.into_content_keys());
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "License attempt {}/{} failed: {}",
                        attempt, self.max_attempts, err
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn acquire_once(&self, header: &ProtectionHeader) -> Result<LicenseResponse> {
        let pending = self.build_request(header)?;
        let signed = self.sign(pending)?;
        let (raw, session) = self.send(signed)?;
        self.parse_response(&raw, session)
    }
}

/// Check a signed license request against the device public key.
///
/// Returns the decoded request when the PSS signature covers the exact
/// transmitted request bytes.
pub fn verify_request(body: &[u8], public_key: &RsaPublicKey) -> Result<LicenseRequest> {
    let signed = SignedMessage::decode(body).map_err(|e| {
        LicenseError::InvalidMessage(format!("Failed to parse SignedMessage: {}", e))
    })?;
    if signed.r#type != Some(MessageType::LicenseRequest as i32) {
        return Err(LicenseError::InvalidMessage(
            "Expected LICENSE_REQUEST message".to_string(),
        ));
    }
    let msg = signed
        .msg
        .as_ref()
        .ok_or_else(|| LicenseError::InvalidMessage("Missing request message".to_string()))?;
    let signature = signed
        .signature
        .as_ref()
        .ok_or_else(|| LicenseError::InvalidMessage("Missing signature".to_string()))?;

    verify_pss_sha1(public_key, msg, signature).map_err(|_| {
        LicenseError::SignatureMismatch("Signature mismatch on license request".to_string())
    })?;

    LicenseRequest::decode(msg.as_slice())
        .map_err(|e| LicenseError::InvalidMessage(format!("Failed to parse LicenseRequest: {}", e)))
}

/// Request id carried by a license request, if any.
#[must_use]
pub fn request_id_of(request: &LicenseRequest) -> Option<&[u8]> {
    match request.content_id.as_ref()?.content_id_variant.as_ref()? {
        ContentIdVariant::WidevinePsshData(data) => data.request_id.as_deref(),
    }
}

/// Encrypt the client id using a service certificate (privacy mode).
///
/// Uses AES-128-CBC with PKCS#5/7 padding and wraps the privacy key using
/// RSA-OAEP with the service certificate public key. `key` and `iv` are
/// optional and default to random 16-byte values.
pub fn encrypt_client_id(
    client_id: &ClientIdentification,
    service_certificate: &SignedDrmCertificate,
    key: Option<&[u8; 16]>,
    iv: Option<&[u8; 16]>,
) -> Result<EncryptedClientIdentification> {
    let mut rng = OsRng;
    let privacy_key = key.copied().unwrap_or_else(|| {
        let mut k = [0u8; 16];
        rng.fill_bytes(&mut k);
        k
    });
    let privacy_iv = iv.copied().unwrap_or_else(|| {
        let mut v = [0u8; 16];
        rng.fill_bytes(&mut v);
        v
    });

    let drm_certificate = decode_drm_certificate(service_certificate)?;
    let public_key = certificate_public_key(&drm_certificate)?;

    let mut buffer = client_id.encode_to_vec();
    let buffer_len = buffer.len();
    buffer.resize(buffer_len + 16, 0);
    let encrypted_client_id = Aes128CbcEnc::new(&privacy_key.into(), &privacy_iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, buffer_len)
        .map_err(|e| LicenseError::Unwrap(format!("Failed to encrypt client_id: {}", e)))?
        .to_vec();

    let encrypted_privacy_key = public_key
        .encrypt(&mut rng, Oaep::new::<Sha1>(), &privacy_key)
        .map_err(|e| LicenseError::Unwrap(format!("Failed to wrap privacy key: {}", e)))?;

    Ok(EncryptedClientIdentification {
        provider_id: drm_certificate.provider_id.clone(),
        service_certificate_serial_number: drm_certificate.serial_number.clone(),
        encrypted_client_id: Some(encrypted_client_id),
        encrypted_client_id_iv: Some(privacy_iv.to_vec()),
        encrypted_privacy_key: Some(encrypted_privacy_key),
    })
}

/// RSASSA-PSS/SHA-1 signature, as used for license requests and DRM
/// certificates.
pub fn sign_pss_sha1(private_key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>> {
    let hash = Sha1::digest(message);
    let mut rng = OsRng;
    private_key
        .sign_with_rng(&mut rng, Pss::new::<Sha1>(), &hash)
        .map_err(|e| LicenseError::InvalidMessage(format!("Failed to sign request: {}", e)))
}

pub(crate) fn verify_pss_sha1(
    public_key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> std::result::Result<(), rsa::Error> {
    let hash = Sha1::digest(message);
    public_key.verify(Pss::new::<Sha1>(), &hash, signature)
}

fn denied_from_error_message(msg: &[u8]) -> LicenseError {
    match LicenseErrorMessage::decode(msg) {
        Ok(message) => {
            let code = message
                .error_code
                .and_then(|c| license_error::Error::try_from(c).ok())
                .map(|c| c.as_str_name())
                .unwrap_or("UNKNOWN");
            LicenseError::Denied(code.to_string())
        }
        Err(_) => LicenseError::Denied("unparseable error response".to_string()),
    }
}

fn root_public_key() -> Result<RsaPublicKey> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(ROOT_SIGNED_CERT_B64)
        .map_err(|e| LicenseError::InvalidMessage(format!("Invalid root certificate: {}", e)))?;
    let signed = SignedDrmCertificate::decode(bytes.as_slice())
        .map_err(|e| LicenseError::InvalidMessage(format!("Invalid root certificate: {}", e)))?;
    certificate_public_key(&decode_drm_certificate(&signed)?)
}

fn decode_drm_certificate(signed: &SignedDrmCertificate) -> Result<DrmCertificate> {
    let bytes = signed
        .drm_certificate
        .as_ref()
        .ok_or_else(|| LicenseError::InvalidMessage("Missing DRM certificate".to_string()))?;
    DrmCertificate::decode(bytes.as_slice())
        .map_err(|e| LicenseError::InvalidMessage(format!("Failed to parse DrmCertificate: {}", e)))
}

fn certificate_public_key(certificate: &DrmCertificate) -> Result<RsaPublicKey> {
    let bytes = certificate
        .public_key
        .as_ref()
        .ok_or_else(|| LicenseError::InvalidMessage("Missing public key".to_string()))?;
    RsaPublicKey::from_pkcs1_der(bytes)
        .map_err(|e| LicenseError::InvalidMessage(format!("Failed to parse public key: {}", e)))
}

fn decode_signed_drm_certificate(data: &[u8]) -> Result<SignedDrmCertificate> {
    if let Ok(signed_message) = SignedMessage::decode(data) {
        if signed_message.r#type == Some(MessageType::ServiceCertificate as i32) {
            let msg_bytes = signed_message.msg.ok_or_else(|| {
                LicenseError::InvalidMessage("SignedMessage missing msg".to_string())
            })?;
            return SignedDrmCertificate::decode(msg_bytes.as_slice()).map_err(|e| {
                LicenseError::InvalidMessage(format!("Failed to parse SignedDrmCertificate: {}", e))
            });
        }
    }

    SignedDrmCertificate::decode(data).map_err(|e| {
        LicenseError::InvalidMessage(format!("Failed to parse SignedDrmCertificate: {}", e))
    })
}

fn verify_signed_certificate(cert: &SignedDrmCertificate, issuer: &RsaPublicKey) -> Result<()> {
    let cert_bytes = cert
        .drm_certificate
        .as_ref()
        .ok_or_else(|| LicenseError::InvalidMessage("Missing DRM certificate".to_string()))?;
    let signature = cert
        .signature
        .as_ref()
        .ok_or_else(|| LicenseError::InvalidMessage("Missing certificate signature".to_string()))?;

    verify_pss_sha1(issuer, cert_bytes, signature).map_err(|_| {
        LicenseError::SignatureMismatch("Signature mismatch on certificate".to_string())
    })
}
