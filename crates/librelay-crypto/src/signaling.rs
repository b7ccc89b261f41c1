//! Signaling-key frame crypto
//!
//! Envelopes arrive over the streaming transport wrapped in an
//! authenticated frame: a version byte, a 16-byte IV, an AES-256-CBC
//! ciphertext, and a 10-byte truncated HMAC-SHA256 tail over everything
//! before it. The 52-byte signaling key splits into the cipher key (32)
//! and the MAC key (20).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Total signaling key length
pub const SIGNALING_KEY_LEN: usize = CIPHER_KEY_LEN + MAC_KEY_LEN;

const CIPHER_KEY_LEN: usize = 32;
const MAC_KEY_LEN: usize = 20;
const VERSION: u8 = 1;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 10;

/// Minimum frame: version, IV, one cipher block, MAC tail
const MIN_FRAME_LEN: usize = 1 + IV_LEN + 16 + MAC_LEN;

/// Symmetric key protecting the streaming transport's envelope frames
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SignalingKey {
    cipher_key: [u8; CIPHER_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
}

impl SignalingKey {
    /// Split raw key material into cipher and MAC halves
    pub fn from_bytes(material: &[u8]) -> Result<Self> {
        if material.len() != SIGNALING_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: SIGNALING_KEY_LEN,
                actual: material.len(),
            });
        }
        let mut cipher_key = [0u8; CIPHER_KEY_LEN];
        let mut mac_key = [0u8; MAC_KEY_LEN];
        cipher_key.copy_from_slice(&material[..CIPHER_KEY_LEN]);
        mac_key.copy_from_slice(&material[CIPHER_KEY_LEN..]);
        Ok(Self {
            cipher_key,
            mac_key,
        })
    }

    /// Verify and decrypt one transport frame, returning the envelope
    /// bytes
    pub fn decrypt_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(CryptoError::InvalidMessage(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        if frame[0] != VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported frame version {}",
                frame[0]
            )));
        }

        let (signed, tag) = frame.split_at(frame.len() - MAC_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        mac.update(signed);
        mac.verify_truncated_left(tag)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        let iv = &signed[1..1 + IV_LEN];
        let ciphertext = &signed[1 + IV_LEN..];
        Aes256CbcDec::new_from_slices(&self.cipher_key, iv)
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: CIPHER_KEY_LEN,
                actual: self.cipher_key.len(),
            })?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::InvalidMessage("bad frame padding".to_string()))
    }

    /// Service-side counterpart of [`decrypt_frame`](Self::decrypt_frame)
    pub fn encrypt_frame(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(&self.cipher_key, &iv)
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: CIPHER_KEY_LEN,
                actual: self.cipher_key.len(),
            })?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut frame = Vec::with_capacity(1 + IV_LEN + ciphertext.len() + MAC_LEN);
        frame.push(VERSION);
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&ciphertext);

        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        mac.update(&frame);
        let tag = mac.finalize().into_bytes();
        frame.extend_from_slice(&tag[..MAC_LEN]);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SignalingKey {
        let mut material = vec![0u8; SIGNALING_KEY_LEN];
        for (i, b) in material.iter_mut().enumerate() {
            *b = i as u8;
        }
        SignalingKey::from_bytes(&material).unwrap()
    }

    #[test]
    fn test_key_length_check() {
        assert!(matches!(
            SignalingKey::from_bytes(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 52,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_frame_roundtrip() {
        let key = test_key();
        let plaintext = b"envelope bytes go here";

        let frame = key.encrypt_frame(plaintext).unwrap();
        assert_eq!(frame[0], 1);
        assert_eq!(key.decrypt_frame(&frame).unwrap(), plaintext);
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let key = test_key();
        let mut frame = key.encrypt_frame(b"payload").unwrap();
        let mid = frame.len() / 2;
        frame[mid] ^= 0xff;

        assert!(matches!(
            key.decrypt_frame(&frame),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let key = test_key();
        let mut frame = key.encrypt_frame(b"payload").unwrap();
        frame[0] = 2;

        assert!(matches!(
            key.decrypt_frame(&frame),
            Err(CryptoError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let key = test_key();
        assert!(key.decrypt_frame(&[1u8; 10]).is_err());
    }
}
