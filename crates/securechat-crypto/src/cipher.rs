use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use anyhow::{Result, anyhow};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("decryption failed")]
pub struct DecryptionFailure;

/// Symmetric codec over the server-held message key.
///
/// `encrypt` returns `(ciphertext_hex, nonce_hex)`; `decrypt` takes them
/// back. Decryption failure is a typed error the read path maps to a
/// placeholder string; it must never propagate out of a listing.
#[derive(Clone)]
pub struct MessageCipher {
    key: [u8; 32],
}

impl MessageCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<(String, String)> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok((hex::encode(ciphertext), hex::encode(nonce_bytes)))
    }

    pub fn decrypt(&self, ciphertext_hex: &str, nonce_hex: &str) -> Result<String, DecryptionFailure> {
        let ciphertext = hex::decode(ciphertext_hex).map_err(|_| DecryptionFailure)?;
        let nonce_bytes = hex::decode(nonce_hex).map_err(|_| DecryptionFailure)?;
        if nonce_bytes.len() != 12 {
            return Err(DecryptionFailure);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|_| DecryptionFailure)?;

        String::from_utf8(plaintext).map_err(|_| DecryptionFailure)
    }

    /// Decrypt for a listing: corrupt rows degrade to a placeholder instead
    /// of failing the whole read.
    pub fn decrypt_or_placeholder(&self, ciphertext_hex: &str, nonce_hex: &str) -> String {
        self.decrypt(ciphertext_hex, nonce_hex)
            .unwrap_or_else(|_| crate::DECRYPTION_ERROR_PLACEHOLDER.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_message_key;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = MessageCipher::new(generate_message_key());
        let message = "Hey, are we still meeting at 5?";

        let (ciphertext, nonce) = cipher.encrypt(message).unwrap();
        assert_ne!(ciphertext, message);

        let decrypted = cipher.decrypt(&ciphertext, &nonce).unwrap();
        assert_eq!(decrypted, message);
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let cipher = MessageCipher::new(generate_message_key());

        let (_, nonce1) = cipher.encrypt("same plaintext").unwrap();
        let (_, nonce2) = cipher.encrypt("same plaintext").unwrap();
        assert_ne!(nonce1, nonce2);
    }

    #[test]
    fn wrong_key_fails() {
        let cipher1 = MessageCipher::new(generate_message_key());
        let cipher2 = MessageCipher::new(generate_message_key());

        let (ciphertext, nonce) = cipher1.encrypt("secret message").unwrap();
        assert!(cipher2.decrypt(&ciphertext, &nonce).is_err());
    }

    #[test]
    fn corrupt_hex_degrades_to_placeholder() {
        let cipher = MessageCipher::new(generate_message_key());
        let rendered = cipher.decrypt_or_placeholder("not-hex-at-all", "00");
        assert_eq!(rendered, crate::DECRYPTION_ERROR_PLACEHOLDER);
    }
}
