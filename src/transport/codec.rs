//! Sealing and opening envelopes through the encryption capability.
//!
//! A message for a target whose public key is the `(0, 0)` sentinel travels
//! as plain JSON. Otherwise the JSON body is encrypted and the resulting
//! integer sequence is JSON-encoded into the `content` string.

use crate::crypto::{Cipher, PrivateKey, PublicKey};
use crate::transport::{Envelope, Message, Payload};
use crate::utils::{CryptoError, Result};
use std::sync::Arc;

/// Encrypting envelope codec for one local identity
#[derive(Clone)]
pub struct MessageCodec {
    sender: String,
    private_key: Option<PrivateKey>,
    cipher: Arc<dyn Cipher>,
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("sender", &self.sender)
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

impl MessageCodec {
    /// Codec sending as `sender`, able to open payloads encrypted for `private_key`
    pub fn new(
        sender: impl Into<String>,
        private_key: Option<PrivateKey>,
        cipher: Arc<dyn Cipher>,
    ) -> Self {
        Self {
            sender: sender.into(),
            private_key,
            cipher,
        }
    }

    /// Name written into every envelope
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Frame `message` for a peer holding `key`
    pub fn seal(&self, message: &Message, key: &PublicKey) -> Result<Envelope> {
        let body = message.body()?;
        let payload = if key.is_plaintext() {
            Payload::Plain(body)
        } else {
            let plaintext = serde_json::to_string(&body)?;
            Payload::Ciphertext(self.cipher.encrypt(key, &plaintext)?)
        };

        Ok(Envelope {
            command: message.command(),
            content: payload.into_value()?,
            sender: self.sender.clone(),
        })
    }

    /// Decode an inbound envelope, decrypting when needed
    pub fn open(&self, envelope: Envelope) -> Result<Message> {
        let body = match envelope.payload() {
            Payload::Plain(body) => body,
            Payload::Ciphertext(blocks) => {
                let key = self.private_key.ok_or(CryptoError::MissingPrivateKey)?;
                let plaintext = self.cipher.decrypt(&key, &blocks)?;
                serde_json::from_str(&plaintext)?
            }
        };
        Message::from_parts(envelope.command, body)
    }
}
