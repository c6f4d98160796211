//! AES-128-CBC over a single 16-byte block.
//!
//! Every frame exchanged with the monitor is exactly one cipher block, so there
//! is never any padding. The IV is fixed at all zeroes, which means the CBC chaining
//! step is the identity for the first (and only) block, but it is kept explicit so
//! the construction matches what the peripheral firmware does.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::{Error, Result};

/// Size of one frame and of one AES block
pub const FRAME_LEN: usize = 16;

/// A single plaintext or ciphertext frame
pub type Frame = [u8; FRAME_LEN];

/// A 16-byte AES-128 key
pub type Key = [u8; 16];

const IV: [u8; FRAME_LEN] = [0u8; FRAME_LEN];

/// Encrypt one 16-byte frame.
pub fn encrypt(plaintext: &[u8], key: &Key) -> Result<Frame> {
    let mut block = to_frame(plaintext)?;
    xor_in_place(&mut block, &IV);

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut ga);

    let mut out = [0u8; FRAME_LEN];
    out.copy_from_slice(&ga);
    Ok(out)
}

/// Decrypt one 16-byte frame.
pub fn decrypt(ciphertext: &[u8], key: &Key) -> Result<Frame> {
    let block = to_frame(ciphertext)?;

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::clone_from_slice(&block);
    cipher.decrypt_block(&mut ga);

    let mut out = [0u8; FRAME_LEN];
    out.copy_from_slice(&ga);
    xor_in_place(&mut out, &IV);
    Ok(out)
}

fn to_frame(data: &[u8]) -> Result<Frame> {
    data.try_into()
        .map_err(|_| Error::InvalidFrameLength(data.len()))
}

fn xor_in_place(block: &mut Frame, other: &Frame) {
    for (b, o) in block.iter_mut().zip(other) {
        *b ^= o;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = *b"0123456789abcdef";

    #[test]
    fn test_roundtrip() {
        let plaintexts = [
            [0u8; 16],
            [0xffu8; 16],
            hex::decode("d1550700000000000000000000000000")
                .unwrap()
                .try_into()
                .unwrap(),
        ];
        for p in plaintexts {
            let c = encrypt(&p, &KEY).unwrap();
            assert_ne!(c, p);
            assert_eq!(decrypt(&c, &KEY).unwrap(), p);
        }
    }

    #[test]
    fn test_zero_iv_cbc_is_single_block_aes() {
        // FIPS-197 appendix C.1 vector
        let key: Key = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let plaintext = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let ciphertext = encrypt(&plaintext, &key).unwrap();
        assert_eq!(hex::encode(ciphertext), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert_eq!(encrypt(&[0u8; 15], &KEY), Err(Error::InvalidFrameLength(15)));
        assert_eq!(decrypt(&[0u8; 17], &KEY), Err(Error::InvalidFrameLength(17)));
        assert_eq!(decrypt(&[], &KEY), Err(Error::InvalidFrameLength(0)));
    }
}
