//! Credential store for Widevine Device (.wvd) bundles.
//!
//! The device file contains the RSA private key and ClientIdentification blob
//! required to authenticate license requests. v2 stores VMP data inside the
//! ClientIdentification message. v1 stored VMP data separately; when parsing
//! v1 the VMP is merged into the ClientIdentification if missing.
//!
//! A loaded [`DeviceCredential`] is immutable. Nothing in this crate writes it
//! back to disk during a download session.

use std::io::Write;
use std::path::{Path, PathBuf};

use prost::Message;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::CredentialError;
use crate::license::verify_pss_sha1;
use crate::license_protocol::drm_certificate::Type as CertificateType;
use crate::license_protocol::{ClientIdentification, DrmCertificate, SignedDrmCertificate};
use crate::utils::config_dir;

type Result<T> = std::result::Result<T, CredentialError>;

/// Magic bytes for WVD files.
const WVD_MAGIC: &[u8; 3] = b"WVD";

/// Current supported WVD version.
const WVD_VERSION: u8 = 2;

/// Environment variable naming a device file to use.
pub const DEVICE_ENV: &str = "RSMUSICDL_CDM";

/// Device types supported by Widevine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceType {
    /// Chrome CDM device.
    Chrome = 1,
    /// Android CDM device.
    Android = 2,
}

impl TryFrom<u8> for DeviceType {
    type Error = CredentialError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(DeviceType::Chrome),
            2 => Ok(DeviceType::Android),
            _ => Err(CredentialError::InvalidWvd(format!(
                "Invalid device type: {}",
                value
            ))),
        }
    }
}

impl From<DeviceType> for u8 {
    fn from(device_type: DeviceType) -> Self {
        device_type as u8
    }
}

/// One decoded certificate of a device chain.
#[derive(Debug, Clone)]
pub struct ChainCertificate {
    /// The decoded certificate body.
    pub certificate: DrmCertificate,
    /// Serialized certificate bytes, as signed by the issuer.
    pub raw: Vec<u8>,
    /// Issuer signature over `raw`, if present.
    pub signature: Option<Vec<u8>>,
    /// Public key carried by the certificate.
    pub public_key: RsaPublicKey,
}

impl ChainCertificate {
    #[must_use]
    pub fn certificate_type(&self) -> Option<CertificateType> {
        self.certificate
            .r#type
            .and_then(|t| CertificateType::try_from(t).ok())
    }
}

/// Device certificate chain ordered leaf first, root last.
#[derive(Debug, Clone)]
pub struct CertificateChain(Vec<ChainCertificate>);

impl CertificateChain {
    /// Flatten a signed device certificate and its nested signers.
    ///
    /// The resulting chain is ordered leaf→root and must be non-empty. Every
    /// certificate carries a public key and, except for the last one, a
    /// signature made by the next certificate's key. The leaf must be a
    /// DEVICE certificate with a system id; a ROOT certificate may only
    /// appear last.
    pub fn from_signed(signed: &SignedDrmCertificate) -> Result<Self> {
        let mut chain = Vec::new();
        let mut current = Some(signed);

        while let Some(signed) = current {
            let raw = signed
                .drm_certificate
                .clone()
                .ok_or_else(|| CredentialError::InvalidChain("DRM certificate missing".into()))?;
            let certificate = DrmCertificate::decode(raw.as_slice()).map_err(|e| {
                CredentialError::InvalidChain(format!("Failed to parse DrmCertificate: {}", e))
            })?;
            let public_key_bytes = certificate.public_key.as_ref().ok_or_else(|| {
                CredentialError::InvalidChain("Certificate public key missing".into())
            })?;
            let public_key = RsaPublicKey::from_pkcs1_der(public_key_bytes).map_err(|e| {
                CredentialError::InvalidChain(format!("Invalid certificate public key: {}", e))
            })?;

            chain.push(ChainCertificate {
                certificate,
                raw,
                signature: signed.signature.clone(),
                public_key,
            });
            current = signed.signer.as_deref();
        }

        let chain = Self(chain);
        chain.validate()?;
        Ok(chain)
    }

    fn validate(&self) -> Result<()> {
        let leaf = self
            .0
            .first()
            .ok_or_else(|| CredentialError::InvalidChain("Certificate chain is empty".into()))?;

        if leaf.certificate_type() != Some(CertificateType::Device) {
            return Err(CredentialError::InvalidChain(format!(
                "Leaf certificate must be DEVICE, got {}",
                leaf.certificate_type()
                    .map(|t| t.as_str_name())
                    .unwrap_or("UNKNOWN")
            )));
        }
        if leaf.certificate.system_id.is_none() {
            return Err(CredentialError::InvalidChain(
                "Leaf certificate has no system id".into(),
            ));
        }

        for (index, cert) in self.0.iter().enumerate() {
            let kind = cert.certificate_type();
            if index > 0 && kind == Some(CertificateType::Device) {
                return Err(CredentialError::InvalidChain(format!(
                    "DEVICE certificate at position {} is not the leaf",
                    index
                )));
            }
            if kind == Some(CertificateType::Root) && index + 1 != self.0.len() {
                return Err(CredentialError::InvalidChain(
                    "ROOT certificate must terminate the chain".into(),
                ));
            }
        }

        for pair in self.0.windows(2) {
            let (subject, issuer) = (&pair[0], &pair[1]);
            let signature = subject.signature.as_deref().ok_or_else(|| {
                CredentialError::InvalidChain("Certificate signature missing".into())
            })?;
            verify_pss_sha1(&issuer.public_key, &subject.raw, signature).map_err(|_| {
                CredentialError::InvalidChain(format!(
                    "Certificate {} is not signed by its issuer",
                    hex::encode(subject.certificate.serial_number.as_deref().unwrap_or_default())
                ))
            })?;
        }
        Ok(())
    }

    /// The device (leaf) certificate.
    #[must_use]
    pub fn leaf(&self) -> &ChainCertificate {
        // validate() guarantees a non-empty chain
        &self.0[0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainCertificate> {
        self.0.iter()
    }
}

/// Device credential: key material and client identification.
///
/// The system id is extracted from the leaf DRM certificate embedded in the
/// ClientIdentification token.
#[derive(Debug, Clone)]
pub struct DeviceCredential {
    /// Device type (Chrome or Android).
    pub device_type: DeviceType,
    /// Security level (1-3, where 1 is highest).
    pub security_level: u8,
    /// Device flags (reserved).
    pub flags: u8,
    /// RSA private key for signing and session key unwrap.
    pub private_key: RsaPrivateKey,
    /// Client identification blob sent with every request.
    pub client_id: ClientIdentification,
    /// Certificate chain from the client id token, leaf first.
    pub certificate_chain: CertificateChain,
    /// System ID extracted from the DRM certificate.
    pub system_id: u32,
}

/// Where a device bundle is loaded from.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// A `.wvd` file on disk.
    Path(PathBuf),
    /// Raw `.wvd` bytes.
    Bytes(Vec<u8>),
}

impl DeviceCredential {
    /// Create a credential from components, validating the certificate chain.
    pub fn new(
        device_type: DeviceType,
        security_level: u8,
        flags: u8,
        private_key: RsaPrivateKey,
        client_id: ClientIdentification,
    ) -> Result<Self> {
        let token = client_id
            .token
            .as_ref()
            .ok_or_else(|| CredentialError::InvalidWvd("Client ID token missing".to_string()))?;

        let signed_drm_cert = SignedDrmCertificate::decode(token.as_slice()).map_err(|e| {
            CredentialError::InvalidChain(format!("Failed to parse SignedDrmCertificate: {}", e))
        })?;
        let certificate_chain = CertificateChain::from_signed(&signed_drm_cert)?;

        let system_id = certificate_chain
            .leaf()
            .certificate
            .system_id
            .ok_or_else(|| CredentialError::InvalidChain("System ID missing".to_string()))?;

        Ok(Self {
            device_type,
            security_level,
            flags,
            private_key,
            client_id,
            certificate_chain,
            system_id,
        })
    }

    /// Load a credential from a path or raw bundle bytes.
    pub fn load(source: CredentialSource) -> Result<Self> {
        match source {
            CredentialSource::Path(path) => Self::from_path(path),
            CredentialSource::Bytes(data) => Self::from_bytes(&data),
        }
    }

    /// Load a credential from a WVD file path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CredentialError::NotFound(path.display().to_string()));
        }
        let data = std::fs::read(path)?;
        let credential = Self::from_bytes(&data)?;
        debug!(
            "Loaded device {} (system id {}, L{})",
            path.display(),
            credential.system_id,
            credential.security_level
        );
        Ok(credential)
    }

    /// Load a credential from WVD bytes (v1 or v2).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let raw = RawWvd::parse(data)?;

        let private_key = RsaPrivateKey::from_pkcs8_der(raw.private_key)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(raw.private_key))
            .map_err(|e| CredentialError::InvalidKey(format!("Failed to parse RSA key: {}", e)))?;

        let mut client_id = ClientIdentification::decode(raw.client_id).map_err(|e| {
            CredentialError::InvalidWvd(format!("Failed to parse ClientIdentification: {}", e))
        })?;

        if let Some(vmp) = raw.vmp.filter(|v| !v.is_empty()) {
            if client_id.vmp_data.as_ref().map_or(true, |d| d.is_empty()) {
                client_id.vmp_data = Some(vmp.to_vec());
            }
        }

        Self::new(
            raw.device_type,
            raw.security_level,
            raw.flags,
            private_key,
            client_id,
        )
    }

    /// Serialize the credential to WVD v2 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let private_key_der = rsa::pkcs8::EncodePrivateKey::to_pkcs8_der(&self.private_key)
            .map_err(|e| CredentialError::InvalidKey(format!("Failed to encode RSA key: {}", e)))?;
        let private_key_bytes = private_key_der.as_bytes();
        let client_id_bytes = self.client_id.encode_to_vec();

        let private_key_len = u16::try_from(private_key_bytes.len())
            .map_err(|_| CredentialError::InvalidKey("Private key too large".to_string()))?;
        let client_id_len = u16::try_from(client_id_bytes.len())
            .map_err(|_| CredentialError::InvalidWvd("Client ID too large".to_string()))?;

        let mut buf = Vec::new();
        buf.write_all(WVD_MAGIC)?;
        buf.write_all(&[
            WVD_VERSION,
            self.device_type.into(),
            self.security_level,
            self.flags,
        ])?;
        buf.write_all(&private_key_len.to_be_bytes())?;
        buf.write_all(private_key_bytes)?;
        buf.write_all(&client_id_len.to_be_bytes())?;
        buf.write_all(&client_id_bytes)?;
        Ok(buf)
    }
}

/// Borrowed view over the fields of a WVD container.
struct RawWvd<'a> {
    device_type: DeviceType,
    security_level: u8,
    flags: u8,
    private_key: &'a [u8],
    client_id: &'a [u8],
    vmp: Option<&'a [u8]>,
}

impl<'a> RawWvd<'a> {
    fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(CredentialError::InvalidWvd("Data too short".to_string()));
        }
        if &data[0..3] != WVD_MAGIC {
            return Err(CredentialError::InvalidWvd("Invalid magic bytes".to_string()));
        }

        let version = data[3];
        if version != 1 && version != WVD_VERSION {
            return Err(CredentialError::InvalidWvd(format!(
                "Unsupported version: {}",
                version
            )));
        }

        let device_type = DeviceType::try_from(data[4])?;
        let security_level = data[5];
        let flags = data[6];

        let mut offset = 7;
        let private_key = read_u16_prefixed(data, &mut offset, "private key")?;
        let client_id = read_u16_prefixed(data, &mut offset, "client ID")?;
        // v1 stored VMP data after the client id
        let vmp = if version == 1 {
            Some(read_u16_prefixed(data, &mut offset, "VMP")?)
        } else {
            None
        };

        Ok(Self {
            device_type,
            security_level,
            flags,
            private_key,
            client_id,
            vmp,
        })
    }
}

fn read_u16_prefixed<'a>(data: &'a [u8], offset: &mut usize, what: &str) -> Result<&'a [u8]> {
    if *offset + 2 > data.len() {
        return Err(CredentialError::InvalidWvd(format!(
            "Data too short for {} length",
            what
        )));
    }
    let len = u16::from_be_bytes([data[*offset], data[*offset + 1]]) as usize;
    *offset += 2;
    if *offset + len > data.len() {
        return Err(CredentialError::InvalidWvd(format!(
            "Data too short for {}",
            what
        )));
    }
    let out = &data[*offset..*offset + len];
    *offset += len;
    Ok(out)
}

/// Locates device bundles in the conventional places.
pub struct CredentialStore;

impl CredentialStore {
    /// Find a device file.
    ///
    /// Checks `$RSMUSICDL_CDM`, then `<config dir>/device.wvd`, then any
    /// `*.wvd` file in the config dir.
    #[must_use]
    pub fn discover() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(DEVICE_ENV).map(PathBuf::from) {
            if path.is_file() {
                return Some(path);
            }
            warn!("{} points to a missing file: {}", DEVICE_ENV, path.display());
        }
        config_dir().and_then(|dir| Self::discover_in(&dir))
    }

    /// Find a device file inside `dir`.
    #[must_use]
    pub fn discover_in(dir: &Path) -> Option<PathBuf> {
        let preferred = dir.join("device.wvd");
        if preferred.is_file() {
            return Some(preferred);
        }

        let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "wvd"))
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }
}
