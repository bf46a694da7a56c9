//! Result formatting and payload encryption.
//!
//! A result travels as
//!
//! ```text
//! base64( IV[16] || AES-CBC(key, IV, message || '0' * pad) )
//! ```
//!
//! where `pad` brings the message to the next multiple of 16 bytes and is a
//! full block when the message is already aligned. The server strips the
//! trailing `'0'` characters after decrypting, which is safe because every
//! formatted result ends in `|`.

use crate::classifier::Move;
use crate::core::EnergySample;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// AES block size, also the IV length.
pub const BLOCK_SIZE: usize = 16;

/// Character used to pad messages.
pub const PAD_CHAR: u8 = b'0';

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encoding and decoding failures.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("key must be 16, 24 or 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload of {0} bytes is not IV plus whole blocks")]
    PayloadLength(usize),

    #[error("decrypted message is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Pre-shared AES key.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey(Vec<u8>);

impl SharedKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, EncodeError> {
        let bytes = bytes.into();
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(bytes)),
            n => Err(EncodeError::KeyLength(n)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&str> for SharedKey {
    type Error = EncodeError;

    fn try_from(key: &str) -> Result<Self, Self::Error> {
        Self::new(key.as_bytes())
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey({} bytes)", self.0.len())
    }
}

/// A confirmed move with its power figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedResult {
    pub action: Move,
    pub voltage: f64,
    pub current: f64,
    pub instantaneous_power: f64,
    pub cumulative_power: f64,
}

impl AcceptedResult {
    pub fn new(action: Move, energy: EnergySample) -> Self {
        Self {
            action,
            voltage: energy.voltage,
            current: energy.current,
            instantaneous_power: energy.instantaneous_power,
            cumulative_power: energy.cumulative_energy,
        }
    }

    /// Plain-text wire form, `#action|voltage|current|power|cumulative|`.
    pub fn format(&self) -> String {
        format_result(
            self.action.as_str(),
            self.voltage,
            self.current,
            self.instantaneous_power,
            self.cumulative_power,
        )
    }
}

/// Format result fields as `#action|voltage|current|power|cumulative|`.
pub fn format_result(action: &str, voltage: f64, current: f64, power: f64, cumulative: f64) -> String {
    format!(
        "#{action}|{}|{}|{}|{}|",
        wire_number(voltage),
        wire_number(current),
        wire_number(power),
        wire_number(cumulative)
    )
}

/// Render a number the way the server's Python `str(float)` does.
///
/// `{:?}` already gives the shortest round-trip digits with a decimal point
/// (5 -> "5.0") and switches to exponent form at the same magnitudes, but
/// writes `1e-5` where Python writes `1e-05`.
fn wire_number(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    let text = format!("{value:?}");
    let Some((mantissa, exponent)) = text.split_once('e') else {
        return text;
    };
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    format!("{mantissa}e{sign}{digits:0>2}")
}

/// Append `'0'` up to the next block boundary; a full block if aligned.
pub fn pad_message(message: &str) -> Vec<u8> {
    let pad = BLOCK_SIZE - message.len() % BLOCK_SIZE;
    let mut padded = Vec::with_capacity(message.len() + pad);
    padded.extend_from_slice(message.as_bytes());
    padded.resize(message.len() + pad, PAD_CHAR);
    padded
}

/// Encrypt a message under a fresh random IV and base64 encode it.
pub fn encrypt_message(message: &str, key: &SharedKey) -> Result<String, EncodeError> {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(message, key, &iv)
}

/// Encrypt with a caller-chosen IV.
pub fn encrypt_with_iv(
    message: &str,
    key: &SharedKey,
    iv: &[u8; BLOCK_SIZE],
) -> Result<String, EncodeError> {
    let padded = pad_message(message);
    let ciphertext = match key.0.len() {
        16 => Aes128CbcEnc::new_from_slices(&key.0, iv)
            .map(|c| c.encrypt_padded_vec_mut::<NoPadding>(&padded)),
        24 => Aes192CbcEnc::new_from_slices(&key.0, iv)
            .map(|c| c.encrypt_padded_vec_mut::<NoPadding>(&padded)),
        _ => Aes256CbcEnc::new_from_slices(&key.0, iv)
            .map(|c| c.encrypt_padded_vec_mut::<NoPadding>(&padded)),
    }
    .map_err(|_| EncodeError::KeyLength(key.0.len()))?;

    let mut payload = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
    payload.extend_from_slice(iv);
    payload.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(payload))
}

/// Decode and decrypt a payload, then strip the `'0'` padding.
///
/// This is the evaluation server's view of a payload.
pub fn decrypt_payload(payload: &str, key: &SharedKey) -> Result<String, EncodeError> {
    let raw = STANDARD.decode(payload.trim())?;
    if raw.len() < 2 * BLOCK_SIZE || raw.len() % BLOCK_SIZE != 0 {
        return Err(EncodeError::PayloadLength(raw.len()));
    }

    let (iv, ciphertext) = raw.split_at(BLOCK_SIZE);
    let plain = match key.0.len() {
        16 => Aes128CbcDec::new_from_slices(&key.0, iv)
            .map(|c| c.decrypt_padded_vec_mut::<NoPadding>(ciphertext)),
        24 => Aes192CbcDec::new_from_slices(&key.0, iv)
            .map(|c| c.decrypt_padded_vec_mut::<NoPadding>(ciphertext)),
        _ => Aes256CbcDec::new_from_slices(&key.0, iv)
            .map(|c| c.decrypt_padded_vec_mut::<NoPadding>(ciphertext)),
    }
    .map_err(|_| EncodeError::KeyLength(key.0.len()))?
    .map_err(|_| EncodeError::PayloadLength(raw.len()))?;

    let message = String::from_utf8(plain)?;
    Ok(message.trim_end_matches(PAD_CHAR as char).to_string())
}
