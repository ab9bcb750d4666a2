//! Binary container format shared by writer and reader

mod codec;
mod format;
mod header;
pub mod telemetry;

pub use codec::{encoded_string_len, truncate_utf8, DataReader, LogData};
pub use format::{
    CloseReason, EntryHeader, FileHeader, ENTRY_HEADER_SIZE, FILE_HEADER_SIZE, FILE_MAGIC,
    FILE_VERSION, ID_AES, ID_AES_DESC, ID_BASE, ID_LZ4, ID_SOURCE_DESC, MAX_ALLOC_SIZE,
    MAX_HEADER_SIZE,
};
pub use header::LogHeader;

use crate::Result;

/// Validate log file magic and version
///
/// # Errors
///
/// Returns error if magic is wrong or version is newer than supported
pub fn validate_header(header: &FileHeader) -> Result<()> {
    if header.magic() != FILE_MAGIC {
        return Err(crate::FdrError::InvalidFormat(format!(
            "Bad magic: {:#010x}, expected {FILE_MAGIC:#010x}",
            header.magic()
        )));
    }

    if header.version() > FILE_VERSION {
        return Err(crate::FdrError::InvalidFormat(format!(
            "Unsupported version: {}, expected at most {FILE_VERSION}",
            header.version()
        )));
    }

    Ok(())
}

/// Append a framed entry (`id`, `len`, payload) to `out`
pub fn push_entry(out: &mut Vec<u8>, id: u32, payload: &[u8]) {
    out.extend_from_slice(EntryHeader::new(id, payload.len() as u32).as_bytes());
    out.extend_from_slice(payload);
}
