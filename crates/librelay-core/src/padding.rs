//! Message body padding
//!
//! Plaintext bodies are padded to a multiple of 160 bytes before
//! encryption so ciphertext length leaks only a coarse size bucket. A
//! single `0x80` terminator marks the end of the real body; everything
//! after it must be zero.

use thiserror::Error;

/// Pad block size in bytes
pub const PAD_BLOCK_SIZE: usize = 160;

const TERMINATOR: u8 = 0x80;

/// Violation of the padding format on decrypt
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaddingError {
    /// No `0x80` terminator found
    #[error("padded body has no terminator")]
    MissingTerminator,

    /// A non-zero byte trails the body where padding should be
    #[error("non-zero byte in padding at offset {0}")]
    NonZeroPadding(usize),
}

/// Pad `message` to the next multiple of [`PAD_BLOCK_SIZE`].
///
/// The result is always strictly longer than the input: a message that
/// already fills a block gains a whole new block for the terminator.
pub fn pad(message: &[u8]) -> Vec<u8> {
    let padded_len = (message.len() / PAD_BLOCK_SIZE + 1) * PAD_BLOCK_SIZE;
    let mut padded = vec![0u8; padded_len];
    padded[..message.len()].copy_from_slice(message);
    padded[message.len()] = TERMINATOR;
    padded
}

/// Strip padding applied by [`pad`], scanning back from the last byte
/// for the terminator.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, PaddingError> {
    for i in (0..padded.len()).rev() {
        match padded[i] {
            0x00 => continue,
            TERMINATOR => return Ok(padded[..i].to_vec()),
            _ => return Err(PaddingError::NonZeroPadding(i)),
        }
    }
    Err(PaddingError::MissingTerminator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_message() {
        let padded = pad(b"hi");
        assert_eq!(padded.len(), 160);
        assert_eq!(&padded[..2], b"hi");
        assert_eq!(padded[2], 0x80);
        assert!(padded[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_block_boundary() {
        // A full block still gains a terminator block
        let message = vec![0x41u8; 160];
        let padded = pad(&message);
        assert_eq!(padded.len(), 320);
        assert_eq!(padded[160], 0x80);
    }

    #[test]
    fn test_empty_message() {
        let padded = pad(b"");
        assert_eq!(padded.len(), 160);
        assert_eq!(padded[0], 0x80);
        assert_eq!(unpad(&padded).unwrap(), b"");
    }

    #[test]
    fn test_unpad_rejects_corrupt_padding() {
        let mut padded = pad(b"hello");
        padded[40] = 0x01;
        assert_eq!(unpad(&padded), Err(PaddingError::NonZeroPadding(40)));
    }

    #[test]
    fn test_unpad_rejects_all_zero() {
        assert_eq!(unpad(&[0u8; 160]), Err(PaddingError::MissingTerminator));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(message in proptest::collection::vec(any::<u8>(), 0..600)) {
            let padded = pad(&message);
            prop_assert_eq!(padded.len() % PAD_BLOCK_SIZE, 0);
            prop_assert!(padded.len() > message.len());
            prop_assert_eq!(unpad(&padded).unwrap(), message);
        }
    }
}
