//! File backend: the active `log.bin` and its rotated predecessors

use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::storage::LogHeader;
use crate::{FdrError, Result};

/// Name of the file being written
pub const ACTIVE_FILE_NAME: &str = "log.bin";

const ROTATED_PREFIX: &str = "log-";

/// Raw output of the logger
pub trait LogBackend {
    /// Create a fresh active file
    ///
    /// # Errors
    ///
    /// Returns error if a file is already open or creation fails
    fn open(&mut self) -> Result<()>;

    /// Close the active file, if any
    fn close(&mut self);

    /// True while a file is open
    fn is_opened(&self) -> bool;

    /// Flush file content to storage
    fn sync(&mut self);

    /// Current write offset of the active file, 0 when closed
    fn size(&self) -> u64;

    /// Append buffers; any error or short write closes the file
    fn writev(&mut self, bufs: &[IoSlice<'_>], quiet: bool);

    /// Append one buffer
    fn write(&mut self, buf: &[u8], quiet: bool) {
        self.writev(&[IoSlice::new(buf)], quiet);
    }

    /// Overwrite bytes at `offset` without moving the write offset
    fn pwrite(&mut self, buf: &[u8], offset: u64);

    /// Free space by deleting old files, then move the previous active file
    /// out of the way
    fn rotate(&mut self, remove_size: u64, max_file_count: u32);

    /// Lowest index the next rotated file may use
    fn min_log_id(&self) -> u32;

    /// Force the next rotated file index above `id`
    fn set_min_log_id(&mut self, id: u32);
}

/// A rotated log file found in the output directory
#[derive(Debug, Clone)]
pub struct LogFile {
    /// Full path
    pub path: PathBuf,
    /// Rotation index parsed from the name
    pub idx: u32,
    /// Size in bytes
    pub size: u64,
    /// Header fields, if the file could be read
    pub header: Option<LogHeader>,
}

impl LogFile {
    /// Value of the `takeoff` field, `"0"` when unknown
    #[must_use]
    pub fn takeoff(&self) -> &str {
        self.header
            .as_ref()
            .and_then(|h| h.get("takeoff"))
            .unwrap_or("0")
    }

    /// `true`/`false`/`unknown`, as reported in the audit trail
    #[must_use]
    pub fn flight(&self) -> &'static str {
        match self.header.as_ref().and_then(|h| h.get("takeoff")) {
            None => "unknown",
            Some("1") => "true",
            Some(_) => "false",
        }
    }

    /// Deletion order: files without takeoff first, then oldest first
    #[must_use]
    pub fn removal_order(&self, other: &Self) -> Ordering {
        let (a, b) = (self.takeoff(), other.takeoff());
        if a == b {
            self.idx.cmp(&other.idx)
        } else if b == "1" {
            Ordering::Less
        } else if a == "1" {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Parse the rotation index of `log-<idx>[...]`
#[must_use]
pub fn parse_log_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(ROTATED_PREFIX)?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Name given to the active file when it is rotated to `idx`
///
/// The boot uuid prefix and creation date are embedded when the header
/// carries both.
#[must_use]
pub fn rotated_file_name(idx: u32, header: Option<&LogHeader>) -> String {
    match header.and_then(|h| Some((h.get("ro.boot.uuid")?, h.get("date")?))) {
        Some((uuid, date)) => format!("{ROTATED_PREFIX}{idx}-{uuid:.5}-{date:>20}.bin"),
        None => format!("{ROTATED_PREFIX}{idx}.bin"),
    }
}

/// Writes `log.bin` in an output directory
pub struct FileBackend {
    output_dir: PathBuf,
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    min_log_id: u32,
}

impl FileBackend {
    /// Backend writing in `output_dir`
    #[must_use]
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            path: output_dir.join(ACTIVE_FILE_NAME),
            file: None,
            offset: 0,
            min_log_id: 0,
        }
    }

    /// Path of the active file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rotated files currently present in the output directory
    #[must_use]
    pub fn list_rotated(&self) -> Vec<LogFile> {
        WalkDir::new(&self.output_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let idx = parse_log_index(entry.file_name().to_str()?)?;
                let path = entry.path().to_path_buf();
                match entry.metadata() {
                    Ok(meta) => Some(LogFile {
                        header: LogHeader::open(&path).ok(),
                        path,
                        idx,
                        size: meta.len(),
                    }),
                    Err(e) => {
                        debug!("lstat '{}' error: {e}", path.display());
                        None
                    }
                }
            })
            .collect()
    }

    fn unlink(file: &LogFile, remove_size: &mut u64) -> io::Result<()> {
        info!(
            target: "fdrlog::audit",
            event = "remove",
            reason = "ROTATE",
            flight = file.flight(),
            path = %file.path.display(),
            "LOGS"
        );
        std::fs::remove_file(&file.path).map_err(|e| {
            error!("unlink('{}'): {e}", file.path.display());
            e
        })?;
        *remove_size = remove_size.saturating_sub(file.size);
        Ok(())
    }

    fn sync_dir(&self) {
        // Non fatal: the file itself is usable
        if let Err(e) = File::open(&self.output_dir).and_then(|dir| dir.sync_all()) {
            error!("fsync({}): {e}", self.output_dir.display());
        }
    }
}

impl LogBackend for FileBackend {
    fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Err(FdrError::AlreadyOpen);
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| {
                error!("open({}): {e}", self.path.display());
                e
            })?;
        self.file = Some(file);
        self.offset = 0;
        self.sync_dir();

        info!("'{}' opened", self.path.display());
        Ok(())
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            self.offset = 0;
            info!("'{}' closed", self.path.display());
        }
    }

    fn is_opened(&self) -> bool {
        self.file.is_some()
    }

    fn sync(&mut self) {
        if let Some(file) = &self.file {
            if let Err(e) = file.sync_all() {
                error!("fsync: {e}");
            }
        }
    }

    fn size(&self) -> u64 {
        self.offset
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>], quiet: bool) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        let len: usize = bufs.iter().map(|b| b.len()).sum();
        match file.write_vectored(bufs) {
            Err(e) => {
                error!("backend write: {e}");
                self.close();
            }
            Ok(written) if written < len => {
                // Treated like a full disk or a size limit
                warn!("backend partial write: {written}({len})");
                self.close();
            }
            Ok(written) => {
                self.offset += written as u64;
                if !quiet {
                    debug!("wrote {written} bytes");
                }
            }
        }
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) {
        let Some(file) = self.file.as_ref() else {
            return;
        };
        if let Err(e) = file.write_all_at(buf, offset) {
            error!("backend pwrite: {e}");
            self.close();
        }
    }

    fn rotate(&mut self, mut remove_size: u64, max_file_count: u32) {
        // Nothing to preserve
        if !self.path.exists() {
            return;
        }

        let mut files = self.list_rotated();
        let highest = files.iter().map(|f| f.idx).max().unwrap_or(0);
        // The active file counts too
        let mut count = files.len() as u32 + 1;

        files.sort_by(LogFile::removal_order);
        let mut candidates = files.iter();
        while (remove_size > 0 || (max_file_count != 0 && count >= max_file_count)) && count > 1 {
            let Some(file) = candidates.next() else {
                break;
            };
            if Self::unlink(file, &mut remove_size).is_ok() {
                count -= 1;
            }
        }

        self.min_log_id = self.min_log_id.max(highest);

        let header = LogHeader::open(&self.path).ok();
        let target = self
            .output_dir
            .join(rotated_file_name(self.min_log_id + 1, header.as_ref()));
        info!("Renaming '{}' -> '{}'", self.path.display(), target.display());
        match std::fs::rename(&self.path, &target) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                error!(
                    "rename('{}', '{}'): {e}",
                    self.path.display(),
                    target.display()
                );
            }
            _ => {}
        }
    }

    fn min_log_id(&self) -> u32 {
        self.min_log_id
    }

    fn set_min_log_id(&mut self, id: u32) {
        self.min_log_id = id;
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        self.close();
    }
}
