//! Envelope encryption of compressed blocks
//!
//! Each session draws a fresh AES-256-CBC key and IV. The key is sealed with
//! an RSA public key (PKCS#1 v1.5) and published in an `AES_DESC` entry
//! together with the SHA-256 of the DER-encoded public key, so an offline
//! tool can pick the matching private key.

use std::path::Path;

use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::storage::{DataReader, LogData};
use crate::{FdrError, Result};

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// AES-256 key size in bytes
pub const AES_KEY_SIZE: usize = 32;

/// SHA-256 digest size in bytes
pub const SHA256_SIZE: usize = 32;

/// Number of padding bytes appended to `len` bytes of plaintext
///
/// Always in `1..=AES_BLOCK_SIZE`: an already aligned input still gets a
/// full block so the last byte always encodes the pad length.
#[must_use]
pub fn pad_len(len: usize) -> usize {
    AES_BLOCK_SIZE - len % AES_BLOCK_SIZE
}

/// Append PKCS#7 padding to `buf`
pub fn pad(buf: &mut Vec<u8>) {
    let n = pad_len(buf.len());
    buf.resize(buf.len() + n, n as u8);
}

/// Strip PKCS#7 padding
///
/// # Errors
///
/// Returns error if the input is not block aligned or the pad is invalid
pub fn unpad(buf: &[u8]) -> Result<&[u8]> {
    let invalid = || FdrError::Encryption("invalid padding".to_string());
    if buf.is_empty() || buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(invalid());
    }
    let n = usize::from(buf[buf.len() - 1]);
    if n == 0 || n > AES_BLOCK_SIZE || buf[buf.len() - n..].iter().any(|&b| usize::from(b) != n) {
        return Err(invalid());
    }
    Ok(&buf[..buf.len() - n])
}

/// Content of an `AES_DESC` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesDescriptor {
    /// SHA-256 of the DER-encoded public key
    pub key_hash: [u8; SHA256_SIZE],
    /// AES key sealed with the public key
    pub sealed_key: Vec<u8>,
    /// CBC initialization vector
    pub iv: [u8; AES_BLOCK_SIZE],
}

impl AesDescriptor {
    /// Encoded payload size
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        3 * std::mem::size_of::<u32>() + SHA256_SIZE + self.sealed_key.len() + AES_BLOCK_SIZE
    }

    /// Encode as `len`-prefixed hash, sealed key and IV
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        let mut data = LogData::new(&mut buf);
        let ok = data.push_u32(SHA256_SIZE as u32)
            && data.push_buffer(&self.key_hash)
            && data.push_u32(self.sealed_key.len() as u32)
            && data.push_buffer(&self.sealed_key)
            && data.push_u32(AES_BLOCK_SIZE as u32)
            && data.push_buffer(&self.iv);
        debug_assert!(ok);
        buf
    }

    /// Decode an `AES_DESC` payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is truncated or sizes are unexpected
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = DataReader::new(payload);

        let len = reader.read_u32()? as usize;
        let key_hash = reader
            .read_bytes(len)?
            .try_into()
            .map_err(|_| FdrError::InvalidFormat(format!("bad key hash size: {len}")))?;

        let len = reader.read_u32()? as usize;
        let sealed_key = reader.read_bytes(len)?.to_vec();

        let len = reader.read_u32()? as usize;
        let iv = reader
            .read_bytes(len)?
            .try_into()
            .map_err(|_| FdrError::InvalidFormat(format!("bad iv size: {len}")))?;

        Ok(Self {
            key_hash,
            sealed_key,
            iv,
        })
    }
}

/// Session encryption context
pub struct EnvelopeCipher {
    encryptor: cbc::Encryptor<Aes256>,
    descriptor: AesDescriptor,
}

impl EnvelopeCipher {
    /// Load a PEM public key (`BEGIN PUBLIC KEY`) and set up a new session
    ///
    /// # Errors
    ///
    /// Returns error if the key cannot be read or parsed, or sealing fails
    pub fn from_public_key_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            FdrError::Encryption(format!("Failed to open '{}': {e}", path.display()))
        })?;
        let key = RsaPublicKey::from_public_key_pem(&pem).map_err(|e| {
            FdrError::Encryption(format!("Failed to load public key '{}': {e}", path.display()))
        })?;
        Self::new(&key)
    }

    /// Set up a new session for `public_key`
    ///
    /// # Errors
    ///
    /// Returns error if the key cannot be encoded or sealing fails
    pub fn new(public_key: &RsaPublicKey) -> Result<Self> {
        let der = public_key
            .to_public_key_der()
            .map_err(|e| FdrError::Encryption(format!("Failed to convert public key: {e}")))?;
        let key_hash: [u8; SHA256_SIZE] = Sha256::digest(der.as_bytes()).into();

        let mut rng = rand::thread_rng();
        let mut key = [0u8; AES_KEY_SIZE];
        let mut iv = [0u8; AES_BLOCK_SIZE];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        let sealed_key = public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, &key)
            .map_err(|e| FdrError::Encryption(format!("Failed to seal key: {e}")))?;

        let encryptor = cbc::Encryptor::<Aes256>::new(&key.into(), &iv.into());
        key.fill(0);

        info!(key_hash = %hex::encode(&key_hash[..8]), "encryption enabled");

        Ok(Self {
            encryptor,
            descriptor: AesDescriptor {
                key_hash,
                sealed_key,
                iv,
            },
        })
    }

    /// Descriptor to publish before the first encrypted entry
    #[must_use]
    pub fn descriptor(&self) -> &AesDescriptor {
        &self.descriptor
    }

    /// Encrypt block-aligned data in place, chaining from the previous call
    ///
    /// # Errors
    ///
    /// Returns error if `data` is not a multiple of the block size
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(FdrError::Encryption(format!(
                "incomplete encryption: {} bytes is not block aligned",
                data.len()
            )));
        }
        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.encryptor
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cbc::cipher::BlockDecryptMut;
    use proptest::prelude::*;
    use rsa::RsaPrivateKey;

    /// Unseal the session key and decrypt a ciphertext, test-only
    pub(crate) fn decrypt(
        private_key: &RsaPrivateKey,
        desc: &AesDescriptor,
        ciphertext: &[u8],
    ) -> Vec<u8> {
        let key = private_key
            .decrypt(Pkcs1v15Encrypt, &desc.sealed_key)
            .unwrap();
        let key: [u8; AES_KEY_SIZE] = key.as_slice().try_into().unwrap();
        let mut decryptor = cbc::Decryptor::<Aes256>::new(&key.into(), &desc.iv.into());
        let mut plain = ciphertext.to_vec();
        for block in plain.chunks_exact_mut(AES_BLOCK_SIZE) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        plain
    }

    pub(crate) fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
    }

    #[test]
    fn test_pad_aligned_adds_full_block() {
        let mut buf = vec![0u8; 32];
        pad(&mut buf);
        assert_eq!(buf.len(), 48);
        assert!(buf[32..].iter().all(|&b| b == 16));
    }

    #[test]
    fn test_unpad_rejects_garbage() {
        assert!(unpad(&[]).is_err());
        assert!(unpad(&[1u8; 15]).is_err());
        let mut block = [3u8; 16];
        block[15] = 0;
        assert!(unpad(&block).is_err());
        block[15] = 17;
        assert!(unpad(&block).is_err());
    }

    #[test]
    fn test_descriptor_encoding() {
        let desc = AesDescriptor {
            key_hash: [7u8; SHA256_SIZE],
            sealed_key: vec![1, 2, 3],
            iv: [9u8; AES_BLOCK_SIZE],
        };
        let payload = desc.encode();
        assert_eq!(payload.len(), 12 + 32 + 3 + 16);
        assert_eq!(&payload[..4], &32u32.to_le_bytes());
        assert_eq!(AesDescriptor::decode(&payload).unwrap(), desc);
        assert!(AesDescriptor::decode(&payload[..40]).is_err());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let private_key = test_key();
        let public_key = RsaPublicKey::from(&private_key);
        let mut cipher = EnvelopeCipher::new(&public_key).unwrap();

        let der = public_key.to_public_key_der().unwrap();
        let expected: [u8; 32] = Sha256::digest(der.as_bytes()).into();
        assert_eq!(cipher.descriptor().key_hash, expected);

        // two consecutive updates chain like a single stream
        let mut first = b"first compressed block".to_vec();
        pad(&mut first);
        let mut second = b"second".to_vec();
        pad(&mut second);
        cipher.encrypt_in_place(&mut first).unwrap();
        cipher.encrypt_in_place(&mut second).unwrap();

        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let plain = decrypt(&private_key, cipher.descriptor(), &stream);
        let (a, b) = plain.split_at(first.len());
        assert_eq!(unpad(a).unwrap(), b"first compressed block");
        assert_eq!(unpad(b).unwrap(), b"second");
    }

    #[test]
    fn test_unaligned_encrypt_rejected() {
        let public_key = RsaPublicKey::from(&test_key());
        let mut cipher = EnvelopeCipher::new(&public_key).unwrap();
        assert!(cipher.encrypt_in_place(&mut [0u8; 15]).is_err());
    }

    #[test]
    fn test_missing_key_file() {
        let err = EnvelopeCipher::from_public_key_file(Path::new("/nonexistent/key.pem"));
        assert!(matches!(err, Err(FdrError::Encryption(_))));
    }

    proptest! {
        #[test]
        fn prop_padding_is_decodable(len in 0usize..1024) {
            let n = pad_len(len);
            prop_assert!((1..=AES_BLOCK_SIZE).contains(&n));

            let mut buf = vec![0xA5u8; len];
            pad(&mut buf);
            prop_assert_eq!(buf.len() % AES_BLOCK_SIZE, 0);
            prop_assert_eq!(unpad(&buf).unwrap().len(), len);
        }
    }
}
