//! Explicit license session state.
//!
//! A license exchange carries state from the signed request to the response:
//! the request id the server echoes back, and the key-derivation contexts built
//! from the exact request bytes. That state lives in a [`SessionState`] value
//! that is moved through `sign → send → parse_response` and consumed once.

use aes::Aes128;
use cmac::{Cmac, Mac};
use rsa::rand_core::{OsRng, RngCore};

use crate::device::DeviceType;
use crate::error::LicenseError;

type CmacAes128 = Cmac<Aes128>;

/// Per-request nonce material. Generated fresh for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestNonce {
    /// Request id echoed back by the server in the license identification.
    pub request_id: Vec<u8>,
    /// Key control nonce embedded in the license request.
    pub key_control_nonce: u32,
}

impl RequestNonce {
    /// Generate a fresh nonce.
    ///
    /// Android devices use the OEMCrypto counter form: 4 random bytes, 4 zero
    /// bytes and a little-endian 64-bit counter, upper-case hex encoded. Other
    /// devices use 16 random bytes.
    #[must_use]
    pub fn generate(device_type: DeviceType, counter: u64) -> Self {
        let mut rng = OsRng;
        let request_id = if device_type == DeviceType::Android {
            let mut req = [0u8; 16];
            rng.fill_bytes(&mut req[..4]);
            req[8..].copy_from_slice(&counter.to_le_bytes());
            hex::encode_upper(req).into_bytes()
        } else {
            let mut req = vec![0u8; 16];
            rng.fill_bytes(&mut req);
            req
        };

        Self {
            request_id,
            key_control_nonce: rng.next_u32(),
        }
    }
}

/// Keys derived from the unwrapped session key.
#[derive(Clone)]
pub struct DerivedKeys {
    /// AES-128 key that wraps content keys.
    pub enc_key: Vec<u8>,
    /// HMAC-SHA256 key for verifying server messages.
    pub mac_key_server: Vec<u8>,
    /// HMAC-SHA256 key for signing client renewals.
    pub mac_key_client: Vec<u8>,
}

/// State of one in-flight license exchange.
#[derive(Debug)]
pub struct SessionState {
    request_id: Vec<u8>,
    enc_context: Vec<u8>,
    mac_context: Vec<u8>,
}

impl SessionState {
    /// Build session state from the exact serialized request that was signed.
    #[must_use]
    pub fn new(request_id: Vec<u8>, request_bytes: &[u8]) -> Self {
        let (enc_context, mac_context) = derive_context(request_bytes);
        Self {
            request_id,
            enc_context,
            mac_context,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> &[u8] {
        &self.request_id
    }

    /// Derive encryption and MAC keys from the unwrapped session key.
    pub fn derive_keys(&self, session_key: &[u8]) -> Result<DerivedKeys, LicenseError> {
        derive_keys(&self.enc_context, &self.mac_context, session_key)
    }
}

/// Derive encryption and MAC context from a message.
///
/// Context format follows Widevine's ENCRYPTION/AUTHENTICATION labels.
#[must_use]
pub fn derive_context(message: &[u8]) -> (Vec<u8>, Vec<u8>) {
    fn context(label: &[u8], msg: &[u8], key_bits: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(label.len() + 1 + msg.len() + 4);
        out.extend_from_slice(label);
        out.push(0);
        out.extend_from_slice(msg);
        out.extend_from_slice(&key_bits.to_be_bytes());
        out
    }

    (
        context(b"ENCRYPTION", message, 16 * 8),
        context(b"AUTHENTICATION", message, 32 * 8 * 2),
    )
}

/// Derive encryption and MAC keys from context and base key using AES-CMAC.
pub fn derive_keys(
    enc_context: &[u8],
    mac_context: &[u8],
    key: &[u8],
) -> Result<DerivedKeys, LicenseError> {
    let derive = |context: &[u8], counter: u8| -> Result<Vec<u8>, LicenseError> {
        let mut mac = CmacAes128::new_from_slice(key).map_err(|_| {
            LicenseError::Unwrap(format!("Session key must be 16 bytes, got {}", key.len()))
        })?;
        mac.update(&[counter]);
        mac.update(context);
        Ok(mac.finalize().into_bytes().to_vec())
    };

    let enc_key = derive(enc_context, 1)?;
    let mut mac_key_server = derive(mac_context, 1)?;
    mac_key_server.extend_from_slice(&derive(mac_context, 2)?);
    let mut mac_key_client = derive(mac_context, 3)?;
    mac_key_client.extend_from_slice(&derive(mac_context, 4)?);

    Ok(DerivedKeys {
        enc_key,
        mac_key_server,
        mac_key_client,
    })
}
