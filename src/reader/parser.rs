//! Entry iteration over a whole log file

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use lz4_flex::frame::FrameDecoder;
use memmap2::Mmap;
use tracing::{error, info, warn};

use super::sources::{LogFileModel, Reconstructor, SourceInfo};
use crate::storage::{
    validate_header, DataReader, EntryHeader, FileHeader, ENTRY_HEADER_SIZE, FILE_HEADER_SIZE,
    ID_AES, ID_AES_DESC, ID_LZ4, ID_SOURCE_DESC, MAX_ALLOC_SIZE,
};
use crate::{FdrError, Result};

struct RegisteredSource {
    info: SourceInfo,
    reconstructor: Reconstructor,
}

/// Parses a log file into a [`LogFileModel`]
///
/// On error the model keeps everything decoded before it.
#[derive(Default)]
pub struct FileParser {
    header_only: bool,
    sources: BTreeMap<u32, RegisteredSource>,
    full_names: HashMap<String, u32>,
    header_source: Option<u32>,
    model: LogFileModel,
}

impl FileParser {
    /// Parser decoding every entry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser stopping once the file header entry is decoded
    #[must_use]
    pub fn header_only() -> Self {
        Self {
            header_only: true,
            ..Self::default()
        }
    }

    /// Model built so far
    #[must_use]
    pub fn model(&self) -> &LogFileModel {
        &self.model
    }

    /// Take the model
    #[must_use]
    pub fn into_model(self) -> LogFileModel {
        self.model
    }

    /// Registered sources, by id
    pub fn sources(&self) -> impl Iterator<Item = &SourceInfo> {
        self.sources.values().map(|s| &s.info)
    }

    /// Validate the file header then decode all entries
    ///
    /// # Errors
    ///
    /// Returns error on a bad magic or version, or an LZ4 block met in
    /// header-only mode. A truncated or oversized entry ends the walk and a
    /// malformed one is skipped; neither is an error.
    pub fn parse(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(header) = bytes.get(..FILE_HEADER_SIZE) else {
            return Err(FdrError::Truncated {
                needed: FILE_HEADER_SIZE,
                available: bytes.len(),
            });
        };
        let mut raw = [0u8; FILE_HEADER_SIZE];
        raw.copy_from_slice(header);
        validate_header(&FileHeader::from_bytes(raw))?;

        self.read_entries(&bytes[FILE_HEADER_SIZE..])
    }

    fn header_found(&self) -> bool {
        self.header_source
            .and_then(|id| self.sources.get(&id))
            .is_some_and(|s| s.reconstructor.is_header_found())
    }

    fn read_entries(&mut self, mut buf: &[u8]) -> Result<()> {
        while buf.len() >= ENTRY_HEADER_SIZE {
            if self.header_only && self.header_found() {
                break;
            }

            let mut raw = [0u8; ENTRY_HEADER_SIZE];
            raw.copy_from_slice(&buf[..ENTRY_HEADER_SIZE]);
            let entry = EntryHeader::from_bytes(raw);
            let len = entry.len() as usize;
            let rest = &buf[ENTRY_HEADER_SIZE..];

            if len > MAX_ALLOC_SIZE {
                warn!("Entry too big: {len}");
                break;
            }
            if rest.len() < len {
                warn!("Truncated entry");
                break;
            }
            if len == 0 {
                warn!("Empty entry");
                break;
            }

            let (payload, tail) = rest.split_at(len);
            buf = tail;

            match entry.id() {
                ID_SOURCE_DESC => {
                    if let Err(e) = self.read_source_desc(payload) {
                        warn!("Bad source description: {e}");
                    }
                }
                ID_LZ4 => {
                    // The header always precedes the first compressed block
                    if self.header_only {
                        return Err(FdrError::InvalidFormat(
                            "compressed block before header".to_string(),
                        ));
                    }
                    match decompress_block(payload) {
                        Ok(block) => {
                            if let Err(e) = self.read_entries(&block) {
                                warn!("lz4 block: {e}");
                            }
                        }
                        Err(e) => warn!("Failed to decompress lz4 block: {e}"),
                    }
                }
                ID_AES_DESC | ID_AES => {
                    warn!("Skipping encrypted entry (id={})", entry.id());
                }
                id => self.dispatch(id, payload),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, id: u32, payload: &[u8]) {
        let Some(source) = self.sources.get_mut(&id) else {
            error!("Source with id={id} not found");
            return;
        };
        if let Err(e) = source.reconstructor.add_entry(payload, &mut self.model) {
            warn!("{}: {e}", source.info.full_name());
        }
    }

    fn read_source_desc(&mut self, payload: &[u8]) -> Result<()> {
        let mut reader = DataReader::new(payload);
        let info = SourceInfo {
            id: reader.read_u32()?,
            version: reader.read_u32()?,
            plugin: reader.read_string()?,
            name: reader.read_string()?,
        };
        self.add_source(info);
        Ok(())
    }

    fn add_source(&mut self, info: SourceInfo) {
        info!(
            "Source: id={} version={} plugin={} name={}",
            info.id, info.version, info.plugin, info.name
        );
        if self.sources.contains_key(&info.id) {
            warn!("Source with id={} already added", info.id);
            return;
        }

        let num = self.full_names.entry(info.full_name()).or_insert(0);
        let name = if *num > 0 {
            format!("{}-{num}", info.name)
        } else {
            info.name.clone()
        };
        *num += 1;

        let reconstructor = Reconstructor::create(&info, name, &mut self.model);
        if info.plugin == "internal" && info.name == "header" {
            self.header_source = Some(info.id);
        }
        self.sources.insert(
            info.id,
            RegisteredSource {
                info,
                reconstructor,
            },
        );
    }
}

/// Decompress one self-contained LZ4 frame
fn decompress_block(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((payload.len() * 4).min(MAX_ALLOC_SIZE));
    FrameDecoder::new(payload)
        .take(MAX_ALLOC_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| FdrError::Compression(e.to_string()))?;
    if out.len() > MAX_ALLOC_SIZE {
        return Err(FdrError::TooBig {
            size: out.len(),
            limit: MAX_ALLOC_SIZE,
        });
    }
    Ok(out)
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before returning to the
    // caller; a concurrent truncation by the daemon is the documented risk
    // of reading the active file.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

/// Parse a whole file
///
/// # Errors
///
/// Returns error if the file cannot be mapped or its file header is invalid.
/// Damaged entries are skipped and the rest of the model is kept.
pub fn load_file(path: &Path) -> Result<LogFileModel> {
    let mmap = map_file(path)?;
    let mut parser = FileParser::new();
    parser.parse(&mmap)?;
    Ok(parser.into_model())
}

/// Parse a file up to its header entry
///
/// # Errors
///
/// Returns error if the file cannot be mapped, parsing fails or no header
/// source is found
pub fn load_info(path: &Path) -> Result<LogFileModel> {
    let mmap = map_file(path)?;
    let mut parser = FileParser::header_only();
    parser.parse(&mmap)?;
    if parser.header_source.is_none() {
        return Err(FdrError::InvalidFormat(format!(
            "{}: no header source",
            path.display()
        )));
    }
    Ok(parser.into_model())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::buffer::WriteBuffer;
    use crate::storage::{push_entry, LogData, FILE_MAGIC, FILE_VERSION, ID_BASE};

    fn file_header() -> Vec<u8> {
        FileHeader::new(FILE_MAGIC, FILE_VERSION).as_bytes().to_vec()
    }

    fn source_desc(id: u32, plugin: &str, name: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 128];
        let mut data = LogData::new(&mut buf);
        assert!(data.push_u32(id) && data.push_u32(1));
        assert!(data.push_string(plugin) && data.push_string(name));
        let len = data.used();
        buf.truncate(len);
        buf
    }

    fn fields(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let mut data = LogData::new(&mut buf);
        for (k, v) in pairs {
            assert!(data.push_string(k) && data.push_string(v));
        }
        let len = data.used();
        buf.truncate(len);
        buf
    }

    fn sample_file() -> Vec<u8> {
        let mut out = file_header();
        push_entry(&mut out, ID_SOURCE_DESC, &source_desc(ID_BASE, "internal", "header"));
        push_entry(&mut out, ID_BASE, &fields(&[("takeoff", "0")]));

        let mut block = Vec::new();
        push_entry(&mut block, ID_SOURCE_DESC, &source_desc(300, "file", "dump"));
        push_entry(&mut block, 300, b"first");
        let mut buffer = WriteBuffer::new(1024, 256);
        assert!(buffer.push_bytes(&block, &mut out));
        buffer.flush(&mut out);

        push_entry(&mut out, 300, b"second");
        out
    }

    #[test]
    fn test_parse_nested_block() {
        let mut parser = FileParser::new();
        parser.parse(&sample_file()).unwrap();
        assert_eq!(parser.sources().count(), 2);

        let model = parser.into_model();
        assert_eq!(model.header().unwrap().value("takeoff"), Some("0"));
        let raw = model.raw("dump").unwrap();
        assert_eq!(raw.entries(), &[b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_header_only_stops_early() {
        let mut parser = FileParser::header_only();
        parser.parse(&sample_file()).unwrap();
        assert_eq!(parser.sources().count(), 1);
        assert!(parser.model().raw("dump").is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_file();
        bytes[0] ^= 0xff;
        assert!(matches!(
            FileParser::new().parse(&bytes),
            Err(FdrError::InvalidFormat(_))
        ));
        assert!(FileParser::new().parse(&bytes[..4]).is_err());
    }

    #[test]
    fn test_truncation_keeps_prefix() {
        let bytes = sample_file();
        let mut parser = FileParser::new();
        parser.parse(&bytes[..bytes.len() - 2]).unwrap();
        let model = parser.into_model();
        assert_eq!(model.raw("dump").unwrap().entries().len(), 1);
    }

    #[test]
    fn test_duplicate_names_and_unknown_ids() {
        let mut out = file_header();
        push_entry(&mut out, ID_SOURCE_DESC, &source_desc(300, "file", "dump"));
        push_entry(&mut out, ID_SOURCE_DESC, &source_desc(301, "file", "dump"));
        // Same id again: ignored
        push_entry(&mut out, ID_SOURCE_DESC, &source_desc(301, "file", "other"));
        push_entry(&mut out, 999, b"lost");
        push_entry(&mut out, 301, b"x");

        let mut parser = FileParser::new();
        parser.parse(&out).unwrap();
        let model = parser.into_model();
        assert!(model.raw("dump").unwrap().entries().is_empty());
        assert_eq!(model.raw("dump-1").unwrap().entries(), &[b"x".to_vec()]);
        assert!(model.raw("other").is_none());
    }

    #[test]
    fn test_corrupt_block_skipped() {
        let mut out = file_header();
        push_entry(&mut out, ID_SOURCE_DESC, &source_desc(300, "file", "dump"));
        push_entry(&mut out, ID_LZ4, b"not an lz4 frame");
        push_entry(&mut out, ID_AES, &[0u8; 16]);
        push_entry(&mut out, 300, b"after");

        let mut parser = FileParser::new();
        parser.parse(&out).unwrap();
        assert_eq!(parser.model().raw("dump").unwrap().entries().len(), 1);
    }

    #[test]
    fn test_empty_and_oversized_entries() {
        let mut out = file_header();
        push_entry(&mut out, ID_SOURCE_DESC, &source_desc(300, "file", "dump"));
        push_entry(&mut out, 300, b"");
        push_entry(&mut out, 300, b"unreached");
        let mut parser = FileParser::new();
        parser.parse(&out).unwrap();
        assert!(parser.model().raw("dump").unwrap().entries().is_empty());

        let mut out = file_header();
        out.extend_from_slice(EntryHeader::new(300, 64 * 1024 * 1024).as_bytes());
        // Declared length larger than the file: truncation, not an error
        assert!(FileParser::new().parse(&out).is_ok());
    }

    fn header_file() -> Vec<u8> {
        let mut out = file_header();
        push_entry(&mut out, ID_SOURCE_DESC, &source_desc(ID_BASE, "internal", "header"));
        push_entry(&mut out, ID_BASE, &fields(&[("takeoff", "1")]));
        out
    }

    #[test]
    fn test_malformed_source_desc_skipped() {
        let mut out = header_file();
        push_entry(&mut out, ID_SOURCE_DESC, &[1, 2, 3]);
        push_entry(&mut out, ID_SOURCE_DESC, &source_desc(300, "file", "dump"));
        push_entry(&mut out, 300, b"kept");

        let mut parser = FileParser::new();
        parser.parse(&out).unwrap();
        let model = parser.into_model();
        assert_eq!(model.header().unwrap().value("takeoff"), Some("1"));
        assert_eq!(model.raw("dump").unwrap().entries(), &[b"kept".to_vec()]);
    }

    #[test]
    fn test_oversized_entry_ends_walk() {
        let mut out = header_file();
        let len = MAX_ALLOC_SIZE + 1;
        out.extend_from_slice(EntryHeader::new(300, len as u32).as_bytes());
        out.resize(out.len() + len, 0);

        let mut parser = FileParser::new();
        parser.parse(&out).unwrap();
        assert_eq!(parser.model().header().unwrap().value("takeoff"), Some("1"));
    }

    #[test]
    fn test_bad_entry_inside_block_keeps_rest() {
        let mut out = header_file();
        let mut block = Vec::new();
        push_entry(&mut block, ID_SOURCE_DESC, &[0xff; 6]);
        push_entry(&mut block, ID_SOURCE_DESC, &source_desc(300, "file", "dump"));
        push_entry(&mut block, 300, b"inner");
        let mut buffer = WriteBuffer::new(1024, 256);
        assert!(buffer.push_bytes(&block, &mut out));
        buffer.flush(&mut out);
        push_entry(&mut out, 300, b"outer");

        let mut parser = FileParser::new();
        parser.parse(&out).unwrap();
        let raw = parser.model().raw("dump").unwrap();
        assert_eq!(raw.entries(), &[b"inner".to_vec(), b"outer".to_vec()]);
    }

    #[test]
    fn test_decompressed_size_capped() {
        let mut frame = Vec::new();
        let mut encoder = lz4_flex::frame::FrameEncoder::new(&mut frame);
        std::io::Write::write_all(&mut encoder, &vec![0u8; MAX_ALLOC_SIZE + 1]).unwrap();
        encoder.finish().unwrap();

        assert!(matches!(
            decompress_block(&frame),
            Err(FdrError::TooBig { .. })
        ));
    }
}
