//! Everything on the evaluation-server side of the relay.
//!
//! - Result formatting and AES-CBC payload encryption
//! - The TCP link that delivers payloads

pub mod encoder;
pub mod server;

pub use encoder::{
    decrypt_payload, encrypt_message, format_result, AcceptedResult, EncodeError, SharedKey,
};
pub use server::{ServerError, ServerLink};
