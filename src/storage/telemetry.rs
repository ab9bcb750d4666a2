//! Telemetry payload sub-format
//!
//! A telemetry source payload is a sequence of tagged blocks. A header block
//! (`TAG_HEADER`) carries the sample geometry and a metadata block describing
//! the variables; sample blocks (`TAG_SAMPLE`) carry a timestamp, a sequence
//! number and `sample_size` raw bytes laid out as described by the metadata.

use super::codec::{DataReader, LogData};
use super::format::MAX_ALLOC_SIZE;
use crate::{FdrError, Result};

/// Header block tag
pub const TAG_HEADER: u8 = 0;

/// Sample block tag
pub const TAG_SAMPLE: u8 = 1;

/// First word of a variable description metadata block
pub const METADATA_MAGIC: u32 = 0x214d_4c54;

/// Largest number of variables accepted in one metadata block
pub const MAX_VAR_COUNT: u32 = 65536;

/// Size of the fixed part of a variable record (6 `u32`)
pub const VAR_RECORD_SIZE: usize = 6 * std::mem::size_of::<u32>();

/// Element type of a telemetry variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VarType {
    /// Boolean stored on one byte
    Bool = 0,
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Signed 8-bit integer
    I8 = 2,
    /// Unsigned 16-bit integer
    U16 = 3,
    /// Signed 16-bit integer
    I16 = 4,
    /// Unsigned 32-bit integer
    U32 = 5,
    /// Signed 32-bit integer
    I32 = 6,
    /// Unsigned 64-bit integer
    U64 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit float
    F32 = 9,
    /// 64-bit float
    F64 = 10,
    /// Fixed size string
    String = 11,
    /// Opaque bytes
    Binary = 12,
}

impl VarType {
    /// Decode a type code
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Bool,
            1 => Self::U8,
            2 => Self::I8,
            3 => Self::U16,
            4 => Self::I16,
            5 => Self::U32,
            6 => Self::I32,
            7 => Self::U64,
            8 => Self::I64,
            9 => Self::F32,
            10 => Self::F64,
            11 => Self::String,
            12 => Self::Binary,
            _ => return None,
        })
    }

    /// Decode one element of `raw` as a double
    ///
    /// Integers are read with the width of `raw`, whatever their declared
    /// type width; unsupported types and widths give 0.0.
    #[must_use]
    pub fn to_f64(self, raw: &[u8]) -> f64 {
        macro_rules! le {
            ($ty:ty) => {
                raw.try_into().map_or(0.0, |b| <$ty>::from_le_bytes(b) as f64)
            };
        }
        match self {
            Self::Bool => raw.first().map_or(0.0, |&b| f64::from(b)),
            Self::I8 | Self::I16 | Self::I32 | Self::I64 => match raw.len() {
                1 => le!(i8),
                2 => le!(i16),
                4 => le!(i32),
                8 => le!(i64),
                _ => 0.0,
            },
            Self::U8 | Self::U16 | Self::U32 | Self::U64 => match raw.len() {
                1 => le!(u8),
                2 => le!(u16),
                4 => le!(u32),
                8 => le!(u64),
                _ => 0.0,
            },
            Self::F32 => le!(f32),
            Self::F64 => le!(f64),
            Self::String | Self::Binary => 0.0,
        }
    }
}

/// Description of one telemetry variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDesc {
    /// Variable name
    pub name: String,
    /// Raw type code, see [`VarType`]
    pub type_code: u32,
    /// Size of one element in bytes
    pub size: u32,
    /// Number of elements, more than one for arrays
    pub count: u32,
}

impl VarDesc {
    /// Scalar or array variable of a known type
    pub fn new(name: impl Into<String>, var_type: VarType, size: u32, count: u32) -> Self {
        Self {
            name: name.into(),
            type_code: var_type as u32,
            size,
            count,
        }
    }

    /// Bytes used in a sample
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        u64::from(self.size) * u64::from(self.count)
    }

    /// Element type, `None` for unknown codes
    #[must_use]
    pub fn var_type(&self) -> Option<VarType> {
        VarType::from_code(self.type_code)
    }

    fn record_len(&self) -> usize {
        (VAR_RECORD_SIZE + self.name.len() + 1).next_multiple_of(4)
    }
}

/// Build a metadata block (magic, count, records)
#[must_use]
pub fn encode_metadata(vars: &[VarDesc]) -> Vec<u8> {
    let len = 2 * std::mem::size_of::<u32>() + vars.iter().map(VarDesc::record_len).sum::<usize>();
    let mut buf = vec![0u8; len];
    let mut data = LogData::new(&mut buf);
    let mut ok = data.push_u32(METADATA_MAGIC) && data.push_u32(vars.len() as u32);
    for var in vars {
        let reclen = var.record_len();
        ok = ok
            && data.push_u32(reclen as u32)
            && data.push_u32(var.name.len() as u32)
            && data.push_u32(var.type_code)
            && data.push_u32(var.size)
            && data.push_u32(var.count)
            && data.push_u32(0)
            && data.push_buffer(var.name.as_bytes())
            && data.skip(reclen - VAR_RECORD_SIZE - var.name.len());
    }
    debug_assert!(ok);
    buf
}

/// Decode the variable records following the metadata magic
///
/// Decoding stops at the first malformed record; the records read so far
/// are returned.
///
/// # Errors
///
/// Returns error if the count is missing or larger than [`MAX_VAR_COUNT`]
pub fn decode_var_descs(buf: &[u8]) -> Result<Vec<VarDesc>> {
    let mut reader = DataReader::new(buf);
    let count = reader.read_u32()?;
    if count > MAX_VAR_COUNT {
        return Err(FdrError::TooBig {
            size: count as usize,
            limit: MAX_VAR_COUNT as usize,
        });
    }

    let mut rest = &buf[std::mem::size_of::<u32>()..];
    let mut vars = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        match decode_record(rest) {
            Some((var, reclen)) => {
                vars.push(var);
                rest = &rest[reclen..];
            }
            None => break,
        }
    }
    Ok(vars)
}

fn decode_record(buf: &[u8]) -> Option<(VarDesc, usize)> {
    let mut reader = DataReader::new(buf);
    let reclen = reader.read_u32().ok()? as usize;
    let namelen = reader.read_u32().ok()? as usize;
    let type_code = reader.read_u32().ok()?;
    let size = reader.read_u32().ok()?;
    let count = reader.read_u32().ok()?;
    let _flags = reader.read_u32().ok()?;

    if buf.len() < reclen || buf.len() < VAR_RECORD_SIZE + namelen + 1 {
        tracing::warn!("buffer too small: {} ({reclen})", buf.len());
        return None;
    }
    let name = &buf[VAR_RECORD_SIZE..VAR_RECORD_SIZE + namelen + 1];
    if name[namelen] != 0 {
        tracing::warn!("string not null terminated");
        return None;
    }
    if size == 0 || count == 0 {
        tracing::warn!("empty variable: size={size} count={count}");
        return None;
    }
    let end = name.iter().position(|&b| b == 0).unwrap_or(namelen);
    let name = String::from_utf8_lossy(&name[..end]).into_owned();

    // A zero record length would loop forever on the same bytes
    let reclen = reclen.max(VAR_RECORD_SIZE + namelen + 1);
    Some((
        VarDesc {
            name,
            type_code,
            size,
            count,
        },
        reclen,
    ))
}

/// Sample geometry from a header block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryHeader {
    /// Samples kept by the producer
    pub sample_count: u32,
    /// Bytes per sample
    pub sample_size: u32,
    /// Acquisition rate
    pub sample_rate: u32,
    /// Bytes of metadata following the header
    pub metadata_size: u32,
}

impl TelemetryHeader {
    /// Encoded size of a header block: tag, geometry and metadata
    #[must_use]
    pub fn block_len(&self) -> usize {
        1 + 4 * std::mem::size_of::<u32>() + self.metadata_size as usize
    }

    /// Read the geometry following a header tag
    ///
    /// # Errors
    ///
    /// Returns error on truncation, or if the sample or metadata size is
    /// above [`MAX_ALLOC_SIZE`]
    pub fn read(reader: &mut DataReader<'_>) -> Result<Self> {
        let header = Self {
            sample_count: reader.read_u32()?,
            sample_size: reader.read_u32()?,
            sample_rate: reader.read_u32()?,
            metadata_size: reader.read_u32()?,
        };
        for size in [header.sample_size, header.metadata_size] {
            if size as usize > MAX_ALLOC_SIZE {
                return Err(FdrError::TooBig {
                    size: size as usize,
                    limit: MAX_ALLOC_SIZE,
                });
            }
        }
        Ok(header)
    }

    /// Push a header block followed by `metadata`
    ///
    /// Nothing is written if the block does not fit.
    pub fn push(&self, data: &mut LogData<'_>, metadata: &[u8]) -> bool {
        if data.remaining() < self.block_len() {
            return false;
        }
        data.push_u8(TAG_HEADER)
            && data.push_u32(self.sample_count)
            && data.push_u32(self.sample_size)
            && data.push_u32(self.sample_rate)
            && data.push_u32(self.metadata_size)
            && data.push_buffer(metadata)
    }
}

/// Encoded size of a sample block carrying `sample_size` bytes
#[must_use]
pub fn sample_block_len(sample_size: usize) -> usize {
    1 + 3 * std::mem::size_of::<u32>() + sample_size
}

/// Push a sample block
///
/// Nothing is written if the block does not fit.
pub fn push_sample(data: &mut LogData<'_>, sec: u32, nsec: u32, seqnum: u32, sample: &[u8]) -> bool {
    if data.remaining() < sample_block_len(sample.len()) {
        return false;
    }
    data.push_u8(TAG_SAMPLE)
        && data.push_u32(sec)
        && data.push_u32(nsec)
        && data.push_u32(seqnum)
        && data.push_buffer(sample)
}
