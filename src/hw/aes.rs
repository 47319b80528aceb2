//! AES-128-CBC engine.
//!
//! Used for two things only: unwrapping a ticket's title key under the
//! common key, and decrypting partition data blocks under that title key.
//! The engine processes at most 0x10000 bytes per command and requires
//! whole 16-byte blocks.

use aes::Aes128;
use aes::cipher::BlockDecrypt;
use aes::cipher::BlockEncrypt;
use aes::cipher::KeyInit;
use aes::cipher::generic_array::GenericArray;
use parking_lot::Mutex;

use super::EngineError;

/// Block size of the cipher.
pub const BLOCK_LEN: usize = 16;

/// Largest input one engine command accepts.
pub const MAX_COMMAND_LEN: usize = 0x10000;

/// The shared AES engine.
#[derive(Debug, Default)]
pub struct AesEngine {
    // One command at a time; the engine has no request queue.
    busy: Mutex<()>,
}

impl AesEngine {
    /// Create the engine singleton.
    pub fn new() -> AesEngine {
        AesEngine::default()
    }

    fn check(input: &[u8], output: &[u8]) -> Result<(), EngineError> {
        if input.len() != output.len()
            || input.len() % BLOCK_LEN != 0
            || input.len() > MAX_COMMAND_LEN
        {
            return Err(EngineError::Invalid);
        }
        Ok(())
    }

    /// CBC-decrypt `input` into `output` (same length, whole blocks).
    pub fn decrypt(
        &self,
        key: &[u8; 16],
        iv: &[u8; 16],
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), EngineError> {
        Self::check(input, output)?;
        let _cmd = self.busy.lock();
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut chain = *iv;
        for (cin, cout) in input.chunks_exact(BLOCK_LEN).zip(output.chunks_exact_mut(BLOCK_LEN)) {
            let mut block = GenericArray::clone_from_slice(cin);
            cipher.decrypt_block(&mut block);
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            chain.copy_from_slice(cin);
            cout.copy_from_slice(&block);
        }
        Ok(())
    }

    /// CBC-encrypt `input` into `output` (same length, whole blocks).
    pub fn encrypt(
        &self,
        key: &[u8; 16],
        iv: &[u8; 16],
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), EngineError> {
        Self::check(input, output)?;
        let _cmd = self.busy.lock();
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut chain = *iv;
        for (cin, cout) in input.chunks_exact(BLOCK_LEN).zip(output.chunks_exact_mut(BLOCK_LEN)) {
            let mut block = GenericArray::clone_from_slice(cin);
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            cipher.encrypt_block(&mut block);
            chain.copy_from_slice(&block);
            cout.copy_from_slice(&block);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A F.2, AES-128-CBC, first two blocks.
    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];
    const IV: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const PLAIN: [u8; 32] = [
        0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17,
        0x2a, 0xae, 0x2d, 0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c, 0x9e, 0xb7, 0x6f, 0xac, 0x45, 0xaf,
        0x8e, 0x51,
    ];
    const CIPHER: [u8; 32] = [
        0x76, 0x49, 0xab, 0xac, 0x81, 0x19, 0xb2, 0x46, 0xce, 0xe9, 0x8e, 0x9b, 0x12, 0xe9, 0x19,
        0x7d, 0x50, 0x86, 0xcb, 0x9b, 0x50, 0x72, 0x19, 0xee, 0x95, 0xdb, 0x11, 0x3a, 0x91, 0x76,
        0x78, 0xb2,
    ];

    #[test]
    fn decrypt_nist_vector() {
        let engine = AesEngine::new();
        let mut out = [0u8; 32];
        engine.decrypt(&KEY, &IV, &CIPHER, &mut out).unwrap();
        assert_eq!(out, PLAIN);
    }

    #[test]
    fn encrypt_nist_vector() {
        let engine = AesEngine::new();
        let mut out = [0u8; 32];
        engine.encrypt(&KEY, &IV, &PLAIN, &mut out).unwrap();
        assert_eq!(out, CIPHER);
    }

    #[test]
    fn round_trip() {
        let engine = AesEngine::new();
        let data: Vec<u8> = (0u8..=255).cycle().take(0x400).collect();
        let mut enc = vec![0u8; data.len()];
        let mut dec = vec![0u8; data.len()];
        engine.encrypt(&KEY, &IV, &data, &mut enc).unwrap();
        engine.decrypt(&KEY, &IV, &enc, &mut dec).unwrap();
        assert_eq!(dec, data);
    }

    #[test]
    fn rejects_partial_blocks() {
        let engine = AesEngine::new();
        let mut out = [0u8; 15];
        assert_eq!(
            engine.decrypt(&KEY, &IV, &CIPHER[..15], &mut out),
            Err(EngineError::Invalid)
        );
    }
}
