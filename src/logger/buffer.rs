//! Staging buffer, LZ4 block compression and optional envelope encryption

use std::io::Write;
use std::path::Path;

use lz4_flex::frame::{FrameEncoder, FrameInfo};
use tracing::{debug, error};

use super::crypto::{self, EnvelopeCipher, AES_BLOCK_SIZE};
use crate::storage::{EntryHeader, ENTRY_HEADER_SIZE, ID_AES, ID_AES_DESC, ID_LZ4};
use crate::{FdrError, Result};

/// Destination of finished entries
pub trait EntryWriter {
    /// Write complete entries; `quiet` suppresses per-write logging
    fn write_entries(&mut self, buf: &[u8], quiet: bool);
}

impl EntryWriter for Vec<u8> {
    fn write_entries(&mut self, buf: &[u8], _quiet: bool) {
        self.extend_from_slice(buf);
    }
}

/// Accumulates raw entries and emits them as a single compressed block
///
/// The raw area holds `flush_threshold + min_space` bytes: producers always
/// find at least `min_space` bytes free right after a flush.
pub struct WriteBuffer {
    raw: Vec<u8>,
    used: usize,
    flush_threshold: usize,
    // [aes header][lz4 header][lz4 frame][pad]
    out: Vec<u8>,
    cipher: Option<EnvelopeCipher>,
}

impl WriteBuffer {
    /// Allocate the staging areas
    #[must_use]
    pub fn new(flush_threshold: usize, min_space: usize) -> Self {
        let capacity = flush_threshold + min_space;
        let out_capacity = lz4_flex::block::get_maximum_output_size(capacity)
            + 2 * ENTRY_HEADER_SIZE
            + AES_BLOCK_SIZE
            + 64;
        Self {
            raw: vec![0u8; capacity],
            used: 0,
            flush_threshold,
            out: Vec::with_capacity(out_capacity),
            cipher: None,
        }
    }

    /// Free space after the write head
    #[must_use]
    pub fn write_space(&self) -> usize {
        self.raw.len() - self.used
    }

    /// Bytes waiting to be flushed
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Unused part of the raw area; fill it, then commit with [`push`](Self::push)
    pub fn write_head(&mut self) -> &mut [u8] {
        &mut self.raw[self.used..]
    }

    /// True once a session key has been set up
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Commit `size` bytes written at the write head, flushing once the
    /// threshold is reached
    pub fn push<W: EntryWriter + ?Sized>(&mut self, size: usize, writer: &mut W) {
        if size > self.write_space() {
            error!(
                "cannot push {size} bytes, buffer only has {} bytes left",
                self.write_space()
            );
            return;
        }
        debug!("pushed {size} bytes");
        self.used += size;
        if self.used >= self.flush_threshold {
            self.flush(writer);
        }
    }

    /// Copy complete entries into the buffer and commit them
    ///
    /// Returns false without writing anything if they do not fit.
    pub fn push_bytes<W: EntryWriter + ?Sized>(&mut self, bytes: &[u8], writer: &mut W) -> bool {
        if bytes.len() > self.write_space() {
            return false;
        }
        self.write_head()[..bytes.len()].copy_from_slice(bytes);
        self.push(bytes.len(), writer);
        true
    }

    /// Compress everything buffered into one LZ4 entry (wrapped in an AES
    /// entry when encryption is enabled) and hand it to `writer`
    ///
    /// Does nothing when the buffer is empty.
    pub fn flush<W: EntryWriter + ?Sized>(&mut self, writer: &mut W) {
        if self.used == 0 {
            return;
        }

        let used = std::mem::take(&mut self.used);
        self.out.clear();
        self.out.resize(2 * ENTRY_HEADER_SIZE, 0);

        if let Err(e) = compress_frame(&self.raw[..used], &mut self.out) {
            error!("lz4 compression of {used} bytes failed: {e}");
            return;
        }

        let lz4_len = self.out.len() - 2 * ENTRY_HEADER_SIZE;
        let header = match entry_header(ID_LZ4, lz4_len) {
            Ok(header) => header,
            Err(e) => {
                error!("lz4 block: {e}");
                return;
            }
        };
        self.out[ENTRY_HEADER_SIZE..2 * ENTRY_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let Some(cipher) = self.cipher.as_mut() else {
            writer.write_entries(&self.out[ENTRY_HEADER_SIZE..], false);
            return;
        };

        // The whole lz4 entry, header included, is padded then encrypted
        let pad = crypto::pad_len(ENTRY_HEADER_SIZE + lz4_len);
        self.out.resize(self.out.len() + pad, pad as u8);
        if let Err(e) = cipher.encrypt_in_place(&mut self.out[ENTRY_HEADER_SIZE..]) {
            error!("{e}");
            return;
        }

        let aes_len = self.out.len() - ENTRY_HEADER_SIZE;
        let header = match entry_header(ID_AES, aes_len) {
            Ok(header) => header,
            Err(e) => {
                error!("aes block: {e}");
                return;
            }
        };
        self.out[..ENTRY_HEADER_SIZE].copy_from_slice(header.as_bytes());
        writer.write_entries(&self.out, false);
    }

    /// Start encrypting flushed blocks with a fresh session key sealed for
    /// the public key at `public_key`
    ///
    /// The `AES_DESC` entry is written to `writer` right away, uncompressed.
    ///
    /// # Errors
    ///
    /// Returns error if the key cannot be loaded or the session key sealed;
    /// nothing is written in that case
    pub fn enable_encryption<W: EntryWriter + ?Sized>(
        &mut self,
        public_key: &Path,
        writer: &mut W,
    ) -> Result<()> {
        let cipher = EnvelopeCipher::from_public_key_file(public_key)?;
        self.install_cipher(cipher, writer);
        Ok(())
    }

    pub(crate) fn install_cipher<W: EntryWriter + ?Sized>(
        &mut self,
        cipher: EnvelopeCipher,
        writer: &mut W,
    ) {
        let payload = cipher.descriptor().encode();
        let mut entry = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len());
        crate::storage::push_entry(&mut entry, ID_AES_DESC, &payload);
        self.cipher = Some(cipher);
        writer.write_entries(&entry, false);
    }

    /// Drop buffered bytes and the session key
    pub fn reset(&mut self) {
        self.used = 0;
        self.cipher = None;
    }
}

/// Append `src` to `out` as one LZ4 frame with content checksum
fn compress_frame(src: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let info = FrameInfo::new().content_checksum(true);
    let mut encoder = FrameEncoder::with_frame_info(info, out);
    encoder.write_all(src)?;
    encoder
        .finish()
        .map_err(|e| FdrError::Compression(e.to_string()))?;
    Ok(())
}

fn entry_header(id: u32, len: usize) -> Result<EntryHeader> {
    let len = u32::try_from(len).map_err(|_| FdrError::TooBig {
        size: len,
        limit: u32::MAX as usize,
    })?;
    Ok(EntryHeader::new(id, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::crypto::tests::{decrypt, test_key};
    use crate::logger::crypto::{unpad, AesDescriptor};
    use crate::storage::ID_BASE;
    use lz4_flex::frame::FrameDecoder;
    use rsa::RsaPublicKey;
    use std::io::Read;

    fn entry(id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        crate::storage::push_entry(&mut out, id, payload);
        out
    }

    fn split_entry(bytes: &[u8]) -> (u32, &[u8], &[u8]) {
        let hdr = EntryHeader::from_bytes(bytes[..ENTRY_HEADER_SIZE].try_into().unwrap());
        let end = ENTRY_HEADER_SIZE + hdr.len() as usize;
        (hdr.id(), &bytes[ENTRY_HEADER_SIZE..end], &bytes[end..])
    }

    fn decompress(frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        FrameDecoder::new(frame).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_entry_header_length_checked() {
        let header = entry_header(ID_LZ4, 42).unwrap();
        assert_eq!((header.id(), header.len()), (ID_LZ4, 42));
        assert!(entry_header(ID_LZ4, u32::MAX as usize).is_ok());
        assert!(matches!(
            entry_header(ID_AES, u32::MAX as usize + 1),
            Err(FdrError::TooBig { .. })
        ));
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let mut buffer = WriteBuffer::new(1024, 256);
        let mut sink = Vec::new();
        buffer.flush(&mut sink);
        buffer.flush(&mut sink);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_flush_emits_single_lz4_entry() {
        let mut buffer = WriteBuffer::new(1024, 256);
        let mut sink = Vec::new();
        let raw = entry(ID_BASE, b"hello hello hello hello");
        assert!(buffer.push_bytes(&raw, &mut sink));
        assert!(sink.is_empty());

        buffer.flush(&mut sink);
        assert_eq!(buffer.used(), 0);

        let (id, frame, rest) = split_entry(&sink);
        assert_eq!(id, ID_LZ4);
        assert!(rest.is_empty());
        assert_eq!(decompress(frame), raw);
    }

    #[test]
    fn test_push_over_threshold_flushes() {
        let mut buffer = WriteBuffer::new(64, 64);
        let mut sink = Vec::new();
        let raw = entry(ID_BASE, &[0x5a; 80]);
        assert!(buffer.push_bytes(&raw, &mut sink));
        assert_eq!(buffer.used(), 0);
        assert_eq!(split_entry(&sink).0, ID_LZ4);
    }

    #[test]
    fn test_push_too_large_is_rejected() {
        let mut buffer = WriteBuffer::new(16, 16);
        let mut sink = Vec::new();
        buffer.push(33, &mut sink);
        assert_eq!(buffer.used(), 0);
        assert!(!buffer.push_bytes(&[0u8; 33], &mut sink));
    }

    #[test]
    fn test_encrypted_flush() {
        let private_key = test_key();
        let cipher = EnvelopeCipher::new(&RsaPublicKey::from(&private_key)).unwrap();

        let mut buffer = WriteBuffer::new(4096, 1024);
        let mut sink = Vec::new();
        buffer.install_cipher(cipher, &mut sink);
        assert!(buffer.is_encrypted());

        let raw = entry(ID_BASE + 1, b"some telemetry");
        assert!(buffer.push_bytes(&raw, &mut sink));
        buffer.flush(&mut sink);

        let (id, desc, rest) = split_entry(&sink);
        assert_eq!(id, ID_AES_DESC);
        let desc = AesDescriptor::decode(desc).unwrap();

        let (id, ciphertext, rest) = split_entry(rest);
        assert_eq!(id, ID_AES);
        assert!(rest.is_empty());
        assert_eq!(ciphertext.len() % AES_BLOCK_SIZE, 0);

        let plain = decrypt(&private_key, &desc, ciphertext);
        let lz4_entry = unpad(&plain).unwrap();
        let (id, frame, rest) = split_entry(lz4_entry);
        assert_eq!(id, ID_LZ4);
        assert!(rest.is_empty());
        assert_eq!(decompress(frame), raw);

        buffer.reset();
        assert!(!buffer.is_encrypted());
    }

    #[test]
    fn test_enable_encryption_missing_key_writes_nothing() {
        let mut buffer = WriteBuffer::new(64, 64);
        let mut sink = Vec::new();
        assert!(buffer
            .enable_encryption(Path::new("/nonexistent/loggerd.pub.pem"), &mut sink)
            .is_err());
        assert!(sink.is_empty());
        assert!(!buffer.is_encrypted());
    }
}
