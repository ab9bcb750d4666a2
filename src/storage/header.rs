//! Lightweight header reader
//!
//! Reads only the file header and the first header entry of a log file,
//! which is enough for rotation decisions and quick triage.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::debug;

use super::codec::DataReader;
use super::format::{
    EntryHeader, FileHeader, ENTRY_HEADER_SIZE, FILE_HEADER_SIZE, MAX_HEADER_SIZE,
};
use crate::{FdrError, Result};

/// Key/value fields of a log file header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogHeader {
    properties: BTreeMap<String, String>,
}

impl LogHeader {
    /// Extract the header fields of the file at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, has a bad magic/version or
    /// a malformed header entry
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        debug!("'{}' opened", path.display());
        Self::read_from(BufReader::new(file))
    }

    /// Extract header fields from a stream positioned at the file start
    ///
    /// # Errors
    ///
    /// Returns error if the stream is not a valid log file
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        super::validate_header(&FileHeader::from_bytes(buf))?;

        // First entry is the description of the header source
        let desc = read_entry_header(&mut reader)?;
        std::io::copy(
            &mut (&mut reader).take(u64::from(desc.len())),
            &mut std::io::sink(),
        )?;

        let entry = read_entry_header(&mut reader)?;
        let len = entry.len() as usize;
        if len > MAX_HEADER_SIZE {
            return Err(FdrError::TooBig {
                size: len,
                limit: MAX_HEADER_SIZE,
            });
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        Self::parse_fields(&payload)
    }

    /// Parse a header entry payload made of key/value string pairs
    ///
    /// # Errors
    ///
    /// Returns error on a malformed string
    pub fn parse_fields(payload: &[u8]) -> Result<Self> {
        let mut properties = BTreeMap::new();
        let mut reader = DataReader::new(payload);
        while !reader.is_empty() {
            let key = reader.read_string()?;
            let value = reader.read_string()?;
            properties.insert(key, value);
        }
        Ok(Self { properties })
    }

    /// True if `key` is present
    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Value associated to `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// True if the header records a takeoff
    #[must_use]
    pub fn has_takeoff(&self) -> bool {
        self.get("takeoff") == Some("1")
    }

    /// All fields, sorted by key
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

impl fmt::Display for LogHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.properties {
            writeln!(f, "[{key}]: [{value}]")?;
        }
        Ok(())
    }
}

fn read_entry_header<R: Read>(reader: &mut R) -> Result<EntryHeader> {
    let mut buf = [0u8; ENTRY_HEADER_SIZE];
    reader.read_exact(&mut buf)?;
    Ok(EntryHeader::from_bytes(buf))
}
