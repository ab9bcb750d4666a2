//! Binary format structures

use bytemuck::{Pod, Zeroable};

/// File magic: "LOG!" read as a little-endian u32
pub const FILE_MAGIC: u32 = 0x2147_4f4c;

/// Current format version, readers accept anything up to it
pub const FILE_VERSION: u32 = 3;

/// File header size
pub const FILE_HEADER_SIZE: usize = 8;

/// Entry header size
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Source description entry
pub const ID_SOURCE_DESC: u32 = 0;

/// LZ4 frame holding a nested stream of entries
pub const ID_LZ4: u32 = 1;

/// Encryption description (sealed key and IV)
pub const ID_AES_DESC: u32 = 2;

/// AES-256-CBC encrypted LZ4 entry
pub const ID_AES: u32 = 3;

/// First id available to application sources
pub const ID_BASE: u32 = 256;

/// Largest entry or telemetry block a reader will allocate
pub const MAX_ALLOC_SIZE: usize = 32 * 1024 * 1024;

/// Largest header entry read by the header reader
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// File header (magic + version)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FileHeader {
    magic: u32,
    version: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);

impl Default for FileHeader {
    fn default() -> Self {
        Self::new(FILE_MAGIC, FILE_VERSION)
    }
}

impl FileHeader {
    /// Build a header, values are stored little-endian
    #[must_use]
    pub fn new(magic: u32, version: u32) -> Self {
        Self {
            magic: magic.to_le(),
            version: version.to_le(),
        }
    }

    /// Decode a header from its on-disk bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; FILE_HEADER_SIZE]) -> Self {
        bytemuck::pod_read_unaligned(&bytes)
    }

    /// On-disk representation
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Magic value
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_le(self.magic)
    }

    /// Format version
    #[must_use]
    pub fn version(&self) -> u32 {
        u32::from_le(self.version)
    }
}

/// Entry header (`id`, `len`), followed by `len` payload bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct EntryHeader {
    id: u32,
    len: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<EntryHeader>(), ENTRY_HEADER_SIZE);

impl EntryHeader {
    /// Build an entry header
    #[must_use]
    pub fn new(id: u32, len: u32) -> Self {
        Self {
            id: id.to_le(),
            len: len.to_le(),
        }
    }

    /// Decode an entry header from its on-disk bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; ENTRY_HEADER_SIZE]) -> Self {
        bytemuck::pod_read_unaligned(&bytes)
    }

    /// On-disk representation
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Entry id
    #[must_use]
    pub fn id(&self) -> u32 {
        u32::from_le(self.id)
    }

    /// Payload length
    #[must_use]
    pub fn len(&self) -> u32 {
        u32::from_le(self.len)
    }

    /// True if the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Control entries use ids below [`ID_BASE`]
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.id() < ID_BASE
    }
}

/// Why a log file was closed, written in the footer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseReason {
    /// Unknown reason
    Unknown,
    /// Initial state, file has not been closed
    #[default]
    NotClosed,
    /// Normal close, daemon is exiting
    Exiting,
    /// Logging temporarily disabled
    Disabled,
    /// Not enough free space on storage
    NoSpaceLeft,
    /// File reached its size limit
    FileTooBig,
    /// Space reserved for logs is exhausted
    QuotaReached,
    /// Explicit rotation
    Rotate,
}

impl CloseReason {
    /// Name written in the footer
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::NotClosed => "NOT_CLOSED",
            Self::Exiting => "EXITING",
            Self::Disabled => "DISABLED",
            Self::NoSpaceLeft => "NO_SPACE_LEFT",
            Self::FileTooBig => "FILE_TOO_BIG",
            Self::QuotaReached => "QUOTA_REACHED",
            Self::Rotate => "ROTATE",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 8);
        assert_eq!(std::mem::size_of::<EntryHeader>(), 8);
    }

    #[test]
    fn test_default_header() {
        let header = FileHeader::default();
        assert_eq!(header.magic(), FILE_MAGIC);
        assert_eq!(header.version(), FILE_VERSION);
        assert_eq!(header.as_bytes(), b"LOG!\x03\x00\x00\x00");
    }

    #[test]
    fn test_entry_header_bytes() {
        let hdr = EntryHeader::new(ID_BASE + 2, 0x0102_0304);
        let bytes: [u8; ENTRY_HEADER_SIZE] = hdr.as_bytes().try_into().unwrap();
        assert_eq!(bytes, [0x02, 0x01, 0, 0, 0x04, 0x03, 0x02, 0x01]);

        let decoded = EntryHeader::from_bytes(bytes);
        assert_eq!(decoded.id(), ID_BASE + 2);
        assert_eq!(decoded.len(), 0x0102_0304);
        assert!(!decoded.is_control());
        assert!(EntryHeader::new(ID_LZ4, 4).is_control());
    }

    #[test]
    fn test_close_reason_names() {
        assert_eq!(CloseReason::default(), CloseReason::NotClosed);
        assert_eq!(CloseReason::QuotaReached.as_str(), "QUOTA_REACHED");
        assert_eq!(CloseReason::FileTooBig.to_string(), "FILE_TOO_BIG");
    }
}
