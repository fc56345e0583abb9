//! rsmusicdl - Widevine license acquisition and CENC audio decryption.
//!
//! This crate provides:
//! - Widevine device (.wvd) loading and certificate chain validation.
//! - Protection header discovery in HLS playlists, MP4 segments and PSSH data.
//! - License request signing, response verification and key unwrapping.
//! - CENC (AES-128-CTR) sample decryption for fragmented MP4.
//! - A download pipeline from media playlist to a clear output file.
//!
//! Feature flags:
//! - `cli`: build the `rsmusicdl` binary.
//! - `tracing`: emit logs through `tracing` (enabled by default).
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Pipeline configuration.
pub mod config;
/// CENC segment decryption.
pub mod decrypt;
/// Widevine device (.wvd) loading and discovery.
pub mod device;
/// Common error types and Result alias.
pub mod error;
/// Manifest and segment fetching.
pub mod fetch;
/// Fragmented MP4 box walking.
pub mod fmp4;
/// HLS media playlists.
pub mod hls;
/// Key ids, content keys and key tables.
pub mod key;
/// License client.
pub mod license;
/// Widevine license protocol messages.
pub mod license_protocol;
/// Output sinks.
pub mod mux;
/// Download pipeline.
pub mod pipeline;
/// Protection header discovery.
pub mod protection;
/// PSSH parsing and construction.
pub mod pssh;
/// License session state and key derivation.
pub mod session;
/// Shared helper utilities.
pub mod utils;

#[cfg(test)]
extern crate self as rsmusicdl;

#[cfg(test)]
mod testutil;
