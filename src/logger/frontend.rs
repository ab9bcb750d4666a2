//! Session lifecycle: header and footer, space limits, patchable fields

use std::collections::BTreeMap;
use std::io::{self, IoSlice};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use super::backend::LogBackend;
use super::buffer::EntryWriter;
use super::source::SourceDesc;
use crate::config::{Config, ExtraProperty, LimitsConfig};
use crate::storage::{
    encoded_string_len, truncate_utf8, CloseReason, EntryHeader, FileHeader, LogData,
    ENTRY_HEADER_SIZE, FILE_HEADER_SIZE, MAX_HEADER_SIZE,
};
use crate::{FdrError, Result};

/// Width reserved for `gcs.name` and `gcs.type`
pub const GCS_FIELD_WIDTH: usize = 128;

/// `reftime.monotonic` until a time reference is known
pub const DEFAULT_REFTIME_MSG: &str = "EVT:TIME;date='1970-01-01';time='T000000+0200'";

/// `reftime.absolute` until a time reference is known
pub const DEFAULT_REFTIME_ABSOLUTE: &str = "00000000000000000000";

/// `control.flight.uuid` until a flight id is known
pub const DEFAULT_FLIGHT_ID: &str = "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF";

const DATE_FORMAT: &str = "%Y%m%dT%H%M%S%z";

/// System properties copied into every header, when available
pub const WELL_KNOWN_PROPERTIES: &[&str] = &[
    "ro.hardware",
    "ro.product.model.id",
    "ro.product.board_id",
    "ro.product.usb.pid",
    "ro.build.date",
    "ro.build.group",
    "ro.build.product",
    "ro.build.project",
    "ro.build.region",
    "ro.build.uid",
    "ro.build.variant",
    "ro.build.version",
    "ro.revision",
    "ro.mech.revision",
    "ro.factory.hcam_serial",
    "ro.factory.serial",
    "ro.factory.product.pro",
    "ro.boot.uuid",
    "ro.smartbattery.gfw_version",
    "ro.smartbattery.g_date",
    "ro.smartbattery.usb_model",
    "ro.smartbattery.usb_version",
    "ro.smartbattery.version",
    "ro.smartbattery.serial",
    "ro.smartbattery.hw_version",
    "ro.smartbattery.design_cap",
    "ro.smartbattery.device_info",
    "ro.smartbattery.device_name",
    "ro.esc.fw_version",
    "ro.esc.hw_version",
    "ddr_info.sync",
    "ro.smartbattery.cycle_count",
    "ro.smartbattery.soh",
];

/// Source of system property values
pub trait PropertyProvider {
    /// Current value of `key`, `None` if unset
    fn get(&self, key: &str) -> Option<String>;
}

impl PropertyProvider for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

/// Filesystem usage queries
pub trait SpaceGauge {
    /// Space available to unprivileged users on the filesystem of `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the filesystem cannot be queried
    fn free_space(&self, dir: &Path) -> io::Result<u64>;

    /// Total size of the regular files directly in `dir`
    fn dir_size(&self, dir: &Path) -> u64;
}

/// [`SpaceGauge`] backed by the real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsGauge;

impl SpaceGauge for FsGauge {
    fn free_space(&self, dir: &Path) -> io::Result<u64> {
        fs2::available_space(dir)
    }

    fn dir_size(&self, dir: &Path) -> u64 {
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| entry.metadata().ok())
            .filter(std::fs::Metadata::is_file)
            .map(|meta| meta.len())
            .sum()
    }
}

/// Location of a header value that can be rewritten in place
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FieldSlot {
    /// File offset of the encoded value
    offset: u64,
    /// Encoded size (length prefix included)
    size: usize,
}

impl FieldSlot {
    fn is_live(self) -> bool {
        self.offset != 0 && self.size != 0
    }
}

#[derive(Debug, Default)]
struct HeaderSlots {
    flight_id: FieldSlot,
    date: FieldSlot,
    gcs_name: FieldSlot,
    gcs_type: FieldSlot,
    md5: FieldSlot,
    monotonic: FieldSlot,
    absolute: FieldSlot,
    takeoff: FieldSlot,
}

#[derive(Debug)]
struct ExtraField {
    key: String,
    read_only: bool,
    value: String,
    slot: FieldSlot,
}

impl From<&ExtraProperty> for ExtraField {
    fn from(property: &ExtraProperty) -> Self {
        Self {
            key: property.key.clone(),
            read_only: property.is_read_only(),
            value: property.initial_value(),
            slot: FieldSlot::default(),
        }
    }
}

/// Serializes key/value header fields, remembering where values land
struct FieldWriter<'a> {
    data: LogData<'a>,
    base: u64,
    ok: bool,
}

impl FieldWriter<'_> {
    fn field(&mut self, key: &str, value: &str, slot: Option<&mut FieldSlot>) {
        self.push(key, value, None, slot);
    }

    fn padded(&mut self, key: &str, value: &str, width: usize, slot: &mut FieldSlot) {
        self.push(key, value, Some(width), Some(slot));
    }

    fn push(&mut self, key: &str, value: &str, width: Option<usize>, slot: Option<&mut FieldSlot>) {
        if !self.ok || !self.data.push_string(key) {
            self.ok = false;
            return;
        }
        let start = self.data.used();
        self.ok = match width {
            Some(width) => self.data.push_string_padded(value, width),
            None => self.data.push_string(value),
        };
        if let (true, Some(slot)) = (self.ok, slot) {
            *slot = FieldSlot {
                offset: self.base + start as u64,
                size: self.data.used() - start,
            };
        }
    }
}

/// Frontend configuration, extracted from [`Config`]
#[derive(Debug, Clone)]
pub struct FrontendOptions {
    /// Directory holding the logs
    pub output_dir: PathBuf,
    /// Disk usage limits
    pub limits: LimitsConfig,
    /// Additional header fields
    pub extra_properties: Vec<ExtraProperty>,
}

impl From<&Config> for FrontendOptions {
    fn from(config: &Config) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            limits: config.limits.clone(),
            extra_properties: config.extra_properties.clone(),
        }
    }
}

/// Writes sessions to a [`LogBackend`]
///
/// Every write is forwarded first, then limits are checked. A breached limit
/// closes the file with the matching reason and opens a new one right away.
pub struct LogFrontend {
    backend: Box<dyn LogBackend>,
    gauge: Box<dyn SpaceGauge>,
    properties: Box<dyn PropertyProvider>,
    output_dir: PathBuf,
    limits: LimitsConfig,
    header_source: SourceDesc,
    footer_source: SourceDesc,
    extra: Vec<ExtraField>,
    slots: HeaderSlots,
    md5_enabled: bool,
    md5: Option<Md5>,
    close_reason: CloseReason,
    closing: bool,
    check_space: bool,
    remove_size: u64,
    used_space: u64,
    index: u32,
    takeoff: bool,
    gcs_name: String,
    gcs_type: String,
    monotonic: String,
    absolute: String,
    session_started: bool,
}

impl LogFrontend {
    /// Frontend writing through `backend`
    #[must_use]
    pub fn new(
        options: FrontendOptions,
        backend: Box<dyn LogBackend>,
        header_source: SourceDesc,
        footer_source: SourceDesc,
    ) -> Self {
        Self {
            backend,
            gauge: Box::new(FsGauge),
            properties: Box::new(BTreeMap::new()),
            extra: options.extra_properties.iter().map(ExtraField::from).collect(),
            output_dir: options.output_dir,
            limits: options.limits,
            header_source,
            footer_source,
            slots: HeaderSlots::default(),
            md5_enabled: false,
            md5: None,
            close_reason: CloseReason::NotClosed,
            closing: false,
            check_space: false,
            remove_size: 0,
            used_space: 0,
            index: 0,
            takeoff: false,
            gcs_name: String::new(),
            gcs_type: String::new(),
            monotonic: DEFAULT_REFTIME_MSG.to_string(),
            absolute: DEFAULT_REFTIME_ABSOLUTE.to_string(),
            session_started: false,
        }
    }

    /// Replace the filesystem gauge
    #[must_use]
    pub fn with_gauge(mut self, gauge: Box<dyn SpaceGauge>) -> Self {
        self.gauge = gauge;
        self
    }

    /// Replace the system property provider
    #[must_use]
    pub fn with_properties(mut self, properties: Box<dyn PropertyProvider>) -> Self {
        self.properties = properties;
        self
    }

    /// Compute the MD5 of the next files
    pub fn enable_md5(&mut self) {
        self.md5_enabled = true;
    }

    /// True while a file is open
    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.backend.is_opened()
    }

    /// Size of the current file
    #[must_use]
    pub fn size(&self) -> u64 {
        self.backend.size()
    }

    /// Reason of the last close, `NotClosed` while open
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
    }

    /// Returns true once per opened file
    ///
    /// The owner must then reset its buffer and mark every source as
    /// needing a new description.
    pub fn take_session_started(&mut self) -> bool {
        std::mem::take(&mut self.session_started)
    }

    /// Rotate old files, open a new one and write its header
    ///
    /// # Errors
    ///
    /// Returns error if a file is already open or the backend cannot open
    pub fn open(&mut self) -> Result<()> {
        if self.is_opened() {
            return Err(FdrError::AlreadyOpen);
        }

        // First open: account for what a previous run left behind
        if self.close_reason == CloseReason::NotClosed {
            self.update_remove_size();
        }

        self.backend
            .rotate(self.remove_size, self.limits.max_log_count);
        self.backend.open()?;

        if self.md5_enabled {
            self.md5 = Some(Md5::new());
        }

        self.used_space = self.gauge.dir_size(&self.output_dir);
        self.close_reason = CloseReason::NotClosed;
        self.write_header();
        self.session_started = true;
        Ok(())
    }

    /// Write the footer, finalize the MD5 and close the file
    ///
    /// Ignored when no file is open or a close is already in progress.
    pub fn close(&mut self, reason: CloseReason) {
        if !self.is_opened() || self.closing {
            return;
        }

        self.closing = true;
        self.close_reason = reason;
        self.write_footer(reason);
        info!(
            "closing log, reason: {reason} ({} bytes written)",
            self.backend.size()
        );

        if let Some(ctx) = self.md5.take() {
            let digest = hex::encode(ctx.finalize());
            if let Err(e) = Self::update_field(
                self.backend.as_mut(),
                &mut self.slots.md5,
                "md5",
                &digest,
                None,
            ) {
                warn!("{e}");
            }
        }

        self.backend.sync();
        self.used_space += self.backend.size();
        self.backend.close();
        self.closing = false;
    }

    /// Flush file content to storage
    pub fn sync(&mut self) {
        self.backend.sync();
    }

    /// Append one buffer
    pub fn write(&mut self, buf: &[u8], quiet: bool) {
        self.writev(&[IoSlice::new(buf)], quiet);
    }

    /// Append buffers, then enforce limits
    pub fn writev(&mut self, bufs: &[IoSlice<'_>], quiet: bool) {
        self.writev_inner(bufs, quiet, false);
    }

    /// Append buffers straight to the backend: no MD5, no limit checks
    pub fn write_raw(&mut self, bufs: &[IoSlice<'_>]) {
        self.backend.writev(bufs, true);
    }

    fn writev_inner(&mut self, bufs: &[IoSlice<'_>], quiet: bool, is_header: bool) {
        if !self.is_opened() {
            return;
        }

        if let (Some(ctx), false) = (self.md5.as_mut(), is_header) {
            for buf in bufs {
                ctx.update(&**buf);
            }
        }

        // Always write, check limits after
        self.backend.writev(bufs, quiet);

        if !self.check_space {
            return;
        }

        self.remove_size = 0;

        // Close first so the space checks reserve room for the next file
        if self.log_size_exceeded() {
            self.close(CloseReason::FileTooBig);
        }

        // Both checks run so the removal size covers both limits, the first
        // breach names the close
        let mut reason = None;
        if self.update_remove_size_for_free_space(quiet) {
            reason = Some(CloseReason::NoSpaceLeft);
        }
        if self.update_remove_size_for_used_space() && reason.is_none() {
            reason = Some(CloseReason::QuotaReached);
        }

        if let (Some(reason), true) = (reason, self.is_opened()) {
            self.close(reason);
        }

        if !self.is_opened() {
            if let Err(e) = self.open() {
                error!("failed to reopen log: {e}");
            }
        }
    }

    fn update_remove_size(&mut self) {
        self.remove_size = 0;
        self.used_space = self.gauge.dir_size(&self.output_dir);
        self.update_remove_size_for_free_space(false);
        self.update_remove_size_for_used_space();
    }

    /// Room kept for a file about to be created
    fn reserved_space(&self) -> u64 {
        if self.is_opened() {
            0
        } else {
            self.limits.min_log_size
        }
    }

    fn schedule_removal(&mut self, size: u64) -> bool {
        if self.remove_size < size {
            self.remove_size = size;
            return true;
        }
        false
    }

    fn update_remove_size_for_free_space(&mut self, quiet: bool) -> bool {
        let reserved = self.reserved_space();
        if self.limits.min_free_space == 0 && reserved == 0 {
            return false;
        }

        let free = match self.gauge.free_space(&self.output_dir) {
            Ok(free) => free,
            Err(e) => {
                if !quiet {
                    error!("statvfs({}): {e}", self.output_dir.display());
                }
                return false;
            }
        };

        if free < self.limits.min_free_space + reserved {
            // Always keep room for the next file once cleaning is needed
            let size = (self.limits.min_free_space + self.limits.min_log_size).saturating_sub(free);
            return self.schedule_removal(size);
        }
        false
    }

    fn update_remove_size_for_used_space(&mut self) -> bool {
        if self.limits.max_used_space == 0 {
            return false;
        }

        let used = self.used_space + self.backend.size();
        if used + self.reserved_space() > self.limits.max_used_space {
            let size = used.saturating_sub(self.limits.max_used_space) + self.limits.min_log_size;
            return self.schedule_removal(size);
        }
        false
    }

    fn log_size_exceeded(&self) -> bool {
        self.limits.max_log_size != 0 && self.backend.size() > self.limits.max_log_size
    }

    fn write_header(&mut self) {
        let file_header = FileHeader::default();

        let mut desc = [0u8; 128];
        let (desc_len, desc_ok) = match self.header_source.fill_description(&mut desc) {
            Some(len) => {
                self.header_source.pending_description = false;
                (len, true)
            }
            None => (0, false),
        };

        let mut entry = vec![0u8; MAX_HEADER_SIZE];
        let prev = FILE_HEADER_SIZE + desc_len + ENTRY_HEADER_SIZE;
        let used = {
            let (hdr, payload) = entry.split_at_mut(ENTRY_HEADER_SIZE);
            let mut fields = FieldWriter {
                data: LogData::new(payload),
                base: self.backend.size() + prev as u64,
                ok: desc_ok,
            };

            fields.field("index", &self.index.to_string(), None);
            self.index += 1;

            for key in WELL_KNOWN_PROPERTIES {
                if let Some(value) = self.properties.get(key) {
                    fields.field(key, &value, None);
                }
            }

            let flight_id = self
                .properties
                .get("control.flight.uuid")
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| DEFAULT_FLIGHT_ID.to_string());
            fields.field(
                "control.flight.uuid",
                &flight_id,
                Some(&mut self.slots.flight_id),
            );

            for property in &mut self.extra {
                let slot = (!property.read_only).then_some(&mut property.slot);
                fields.field(&property.key, &property.value, slot);
            }

            fields.field("date", &current_date(), Some(&mut self.slots.date));
            fields.padded(
                "gcs.name",
                &self.gcs_name,
                GCS_FIELD_WIDTH,
                &mut self.slots.gcs_name,
            );
            fields.padded(
                "gcs.type",
                &self.gcs_type,
                GCS_FIELD_WIDTH,
                &mut self.slots.gcs_type,
            );

            // Placeholder, rewritten on close
            fields.field("md5", &"f".repeat(32), Some(&mut self.slots.md5));

            fields.field(
                "reftime.monotonic",
                &self.monotonic,
                Some(&mut self.slots.monotonic),
            );
            if self.monotonic != DEFAULT_REFTIME_MSG {
                self.slots.monotonic = FieldSlot::default();
            }
            fields.field(
                "reftime.absolute",
                &self.absolute,
                Some(&mut self.slots.absolute),
            );
            if self.absolute != DEFAULT_REFTIME_ABSOLUTE {
                self.slots.absolute = FieldSlot::default();
            }

            fields.field(
                "takeoff",
                if self.takeoff { "1" } else { "0" },
                Some(&mut self.slots.takeoff),
            );

            let len = if fields.ok { fields.data.used() } else { 0 };
            if !fields.ok {
                error!("header does not fit in {MAX_HEADER_SIZE} bytes");
            }
            hdr.copy_from_slice(EntryHeader::new(self.header_source.id, len as u32).as_bytes());
            ENTRY_HEADER_SIZE + len
        };

        self.check_space = false;
        self.writev_inner(
            &[
                IoSlice::new(file_header.as_bytes()),
                IoSlice::new(&desc[..desc_len]),
                IoSlice::new(&entry[..used]),
            ],
            false,
            true,
        );
        self.check_space = true;
    }

    fn write_footer(&mut self, reason: CloseReason) {
        let desc = self.footer_source.description();

        let mut payload =
            vec![0u8; encoded_string_len("reason") + encoded_string_len(reason.as_str())];
        let mut data = LogData::new(&mut payload);
        let ok = data.push_string("reason") && data.push_string(reason.as_str());
        let len = if ok { data.used() } else { 0 };
        let hdr = EntryHeader::new(self.footer_source.id, len as u32);

        self.check_space = false;
        self.writev_inner(
            &[
                IoSlice::new(&desc),
                IoSlice::new(hdr.as_bytes()),
                IoSlice::new(&payload[..len]),
            ],
            false,
            false,
        );
        self.check_space = true;
    }

    /// Rewrite a header value in place
    ///
    /// No-op when the slot was never recorded or was already rewritten.
    fn update_field(
        backend: &mut dyn LogBackend,
        slot: &mut FieldSlot,
        desc: &str,
        value: &str,
        width: Option<usize>,
    ) -> Result<()> {
        if !slot.is_live() {
            return Ok(());
        }

        let expected = std::mem::size_of::<u16>() + width.unwrap_or(value.len()) + 1;
        let mut buf = vec![0u8; expected];
        let mut data = LogData::new(&mut buf);
        let ok = match width {
            Some(width) => data.push_string_padded(value, width),
            None => data.push_string(value),
        };
        let actual = if ok { data.used() } else { expected };

        if !ok || actual != slot.size {
            warn!(
                "Failed to rewrite {desc}, size mismatch: {actual}({})",
                slot.size
            );
            return Err(FdrError::FieldRewrite {
                field: desc.to_string(),
                expected: slot.size,
                actual,
            });
        }

        info!("Update {desc} @{}:{} -> {value}", slot.offset, slot.size);
        backend.pwrite(&buf[..actual], slot.offset);
        *slot = FieldSlot::default();
        Ok(())
    }

    /// Rewrite `date` with the current local time
    ///
    /// # Errors
    ///
    /// Returns error if the encoded date size changed
    pub fn update_date(&mut self) -> Result<()> {
        Self::update_field(
            self.backend.as_mut(),
            &mut self.slots.date,
            "date",
            &current_date(),
            None,
        )
    }

    /// Rewrite `control.flight.uuid`
    ///
    /// # Errors
    ///
    /// Returns error if `flight_id` does not have the reserved size
    pub fn update_flight_id(&mut self, flight_id: &str) -> Result<()> {
        Self::update_field(
            self.backend.as_mut(),
            &mut self.slots.flight_id,
            "flight_id",
            flight_id,
            None,
        )
    }

    /// Rewrite `gcs.name`; the value is kept for the next headers
    ///
    /// # Errors
    ///
    /// Never fails in practice: the field has a fixed width
    pub fn update_gcs_name(&mut self, name: &str) -> Result<()> {
        self.gcs_name = truncate_utf8(name, GCS_FIELD_WIDTH).to_string();
        Self::update_field(
            self.backend.as_mut(),
            &mut self.slots.gcs_name,
            "gcs_name",
            &self.gcs_name,
            Some(GCS_FIELD_WIDTH),
        )
    }

    /// Rewrite `gcs.type`; the value is kept for the next headers
    ///
    /// # Errors
    ///
    /// Never fails in practice: the field has a fixed width
    pub fn update_gcs_type(&mut self, gcs_type: &str) -> Result<()> {
        self.gcs_type = truncate_utf8(gcs_type, GCS_FIELD_WIDTH).to_string();
        Self::update_field(
            self.backend.as_mut(),
            &mut self.slots.gcs_type,
            "gcs_type",
            &self.gcs_type,
            Some(GCS_FIELD_WIDTH),
        )
    }

    /// Record the reference time: the `EVT:TIME` message and the matching
    /// absolute time
    ///
    /// Only done once per file, while both fields still hold their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a value does not have the reserved size
    pub fn update_ref_time(&mut self, message: &str, sec: i64, nsec: u32) -> Result<()> {
        if !self.slots.monotonic.is_live() || !self.slots.absolute.is_live() {
            return Ok(());
        }

        let us = sec.max(0).unsigned_abs() * 1_000_000 + u64::from(nsec / 1000);
        self.monotonic = message.to_string();
        self.absolute = format!("{us:020}");

        let monotonic = Self::update_field(
            self.backend.as_mut(),
            &mut self.slots.monotonic,
            "monotonic",
            &self.monotonic,
            None,
        );
        let absolute = Self::update_field(
            self.backend.as_mut(),
            &mut self.slots.absolute,
            "absolute",
            &self.absolute,
            None,
        );
        monotonic.and(absolute)
    }

    /// Rewrite `takeoff` when it changes
    ///
    /// # Errors
    ///
    /// Never fails in practice: both values have the same size
    pub fn update_takeoff(&mut self, takeoff: bool) -> Result<()> {
        if takeoff == self.takeoff || !self.slots.takeoff.is_live() {
            return Ok(());
        }
        self.takeoff = takeoff;
        Self::update_field(
            self.backend.as_mut(),
            &mut self.slots.takeoff,
            "takeoff",
            if takeoff { "1" } else { "0" },
            None,
        )
    }

    /// Rewrite a patchable extra property; the value is kept for the next
    /// headers
    ///
    /// # Errors
    ///
    /// Returns error if `value` does not have the reserved size
    pub fn update_extra_property(&mut self, key: &str, value: &str) -> Result<()> {
        let backend = self.backend.as_mut();
        let mut result = Ok(());
        for property in self.extra.iter_mut().filter(|p| p.key == key) {
            property.value = value.to_string();
            if let Err(e) =
                Self::update_field(backend, &mut property.slot, key, &property.value, None)
            {
                result = Err(e);
            }
        }
        result
    }
}

impl EntryWriter for LogFrontend {
    fn write_entries(&mut self, buf: &[u8], quiet: bool) {
        self.write(buf, quiet);
    }
}

fn current_date() -> String {
    chrono::Local::now().format(DATE_FORMAT).to_string()
}

/// Longest prefix of `s` within `width` bytes, on a char boundary

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::backend::{FileBackend, ACTIVE_FILE_NAME};
    use crate::storage::{DataReader, LogHeader, ID_BASE, ID_SOURCE_DESC};
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::TempDir;

    struct FakeGauge {
        free: Rc<Cell<u64>>,
    }

    impl SpaceGauge for FakeGauge {
        fn free_space(&self, _dir: &Path) -> io::Result<u64> {
            Ok(self.free.get())
        }

        fn dir_size(&self, dir: &Path) -> u64 {
            FsGauge.dir_size(dir)
        }
    }

    fn frontend(dir: &Path, limits: LimitsConfig, extra: Vec<ExtraProperty>) -> LogFrontend {
        let options = FrontendOptions {
            output_dir: dir.to_path_buf(),
            limits,
            extra_properties: extra,
        };
        LogFrontend::new(
            options,
            Box::new(FileBackend::new(dir)),
            SourceDesc::new(ID_BASE, "internal", "header", 3),
            SourceDesc::new(ID_BASE + 1, "internal", "footer", 3),
        )
    }

    fn active(dir: &Path) -> PathBuf {
        dir.join(ACTIVE_FILE_NAME)
    }

    /// Size of file header + header description + header entry
    fn header_len(bytes: &[u8]) -> usize {
        let mut off = FILE_HEADER_SIZE;
        for _ in 0..2 {
            let hdr = EntryHeader::from_bytes(bytes[off..off + 8].try_into().unwrap());
            off += ENTRY_HEADER_SIZE + hdr.len() as usize;
        }
        off
    }

    fn entry_ids(bytes: &[u8]) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut off = FILE_HEADER_SIZE;
        while off + ENTRY_HEADER_SIZE <= bytes.len() {
            let hdr = EntryHeader::from_bytes(bytes[off..off + 8].try_into().unwrap());
            ids.push(hdr.id());
            off += ENTRY_HEADER_SIZE + hdr.len() as usize;
        }
        ids
    }

    #[test]
    fn test_open_writes_header() {
        let dir = TempDir::new().unwrap();
        let mut props = BTreeMap::new();
        props.insert("ro.boot.uuid".to_string(), "0123456789".to_string());
        let mut fe = frontend(dir.path(), LimitsConfig::default(), Vec::new())
            .with_properties(Box::new(props));

        fe.open().unwrap();
        assert!(fe.take_session_started());
        assert!(!fe.take_session_started());
        assert!(matches!(fe.open(), Err(FdrError::AlreadyOpen)));

        let header = LogHeader::open(&active(dir.path())).unwrap();
        assert_eq!(header.get("index"), Some("0"));
        assert_eq!(header.get("ro.boot.uuid"), Some("0123456789"));
        assert!(!header.has_key("ro.hardware"));
        assert_eq!(header.get("control.flight.uuid"), Some(DEFAULT_FLIGHT_ID));
        assert_eq!(header.get("md5"), Some("f".repeat(32).as_str()));
        assert_eq!(header.get("reftime.monotonic"), Some(DEFAULT_REFTIME_MSG));
        assert_eq!(header.get("reftime.absolute"), Some(DEFAULT_REFTIME_ABSOLUTE));
        assert_eq!(header.get("gcs.name"), Some(""));
        assert_eq!(header.get("date").map(str::len), Some(20));
        assert!(!header.has_takeoff());
    }

    #[test]
    fn test_takeoff_rewrite_in_place() {
        let dir = TempDir::new().unwrap();
        let mut fe = frontend(dir.path(), LimitsConfig::default(), Vec::new());
        fe.open().unwrap();
        fe.write(&[1, 0, 0, 0, 4, 0, 0, 0, 9, 9, 9, 9], false);

        let before = std::fs::read(active(dir.path())).unwrap();
        fe.update_takeoff(true).unwrap();
        // Second call is a no-op
        fe.update_takeoff(true).unwrap();

        let after = std::fs::read(active(dir.path())).unwrap();
        assert_eq!(before.len(), after.len());
        assert_eq!(before.iter().zip(&after).filter(|(a, b)| a != b).count(), 1);
        assert!(LogHeader::open(&active(dir.path())).unwrap().has_takeoff());
    }

    #[test]
    fn test_rewrite_size_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let extra = vec![ExtraProperty {
            key: "ro.custom.id".to_string(),
            size: 4,
            value: String::new(),
        }];
        let mut fe = frontend(dir.path(), LimitsConfig::default(), extra);
        fe.open().unwrap();

        let before = std::fs::read(active(dir.path())).unwrap();
        let err = fe.update_extra_property("ro.custom.id", "too-long").unwrap_err();
        assert!(matches!(
            err,
            FdrError::FieldRewrite { expected: 7, actual: 11, .. }
        ));
        assert_eq!(std::fs::read(active(dir.path())).unwrap(), before);

        fe.update_extra_property("ro.custom.id", "abcd").unwrap();
        let header = LogHeader::open(&active(dir.path())).unwrap();
        assert_eq!(header.get("ro.custom.id"), Some("abcd"));

        // Single shot
        fe.update_extra_property("ro.custom.id", "wxyz").unwrap();
        let header = LogHeader::open(&active(dir.path())).unwrap();
        assert_eq!(header.get("ro.custom.id"), Some("abcd"));
    }

    #[test]
    fn test_read_only_extra_property() {
        let dir = TempDir::new().unwrap();
        let extra = vec![ExtraProperty {
            key: "ro.custom.fixed".to_string(),
            size: 4,
            value: "ab".to_string(),
        }];
        let mut fe = frontend(dir.path(), LimitsConfig::default(), extra);
        fe.open().unwrap();
        fe.update_extra_property("ro.custom.fixed", "cdef").unwrap();
        let header = LogHeader::open(&active(dir.path())).unwrap();
        assert_eq!(header.get("ro.custom.fixed"), Some("abFF"));
    }

    #[test]
    fn test_gcs_and_ref_time() {
        let dir = TempDir::new().unwrap();
        let mut fe = frontend(dir.path(), LimitsConfig::default(), Vec::new());
        fe.open().unwrap();

        fe.update_gcs_name("FreeFlight").unwrap();
        fe.update_gcs_type(&"x".repeat(200)).unwrap();
        let msg = "EVT:TIME;date='2024-05-01';time='T101010+0200'";
        fe.update_ref_time(msg, 12, 345_678).unwrap();

        let header = LogHeader::open(&active(dir.path())).unwrap();
        assert_eq!(header.get("gcs.name"), Some("FreeFlight"));
        assert_eq!(header.get("gcs.type").map(str::len), Some(GCS_FIELD_WIDTH));
        assert_eq!(header.get("reftime.monotonic"), Some(msg));
        assert_eq!(header.get("reftime.absolute"), Some("00000000000012345678"));

        // Next file carries the values, reference time is no longer patchable
        fe.close(CloseReason::Rotate);
        fe.open().unwrap();
        let header = LogHeader::open(&active(dir.path())).unwrap();
        assert_eq!(header.get("index"), Some("1"));
        assert_eq!(header.get("gcs.name"), Some("FreeFlight"));
        assert_eq!(header.get("reftime.monotonic"), Some(msg));
        fe.update_ref_time(DEFAULT_REFTIME_MSG, 0, 0).unwrap();
        let header = LogHeader::open(&active(dir.path())).unwrap();
        assert_eq!(header.get("reftime.monotonic"), Some(msg));
    }

    #[test]
    fn test_close_writes_footer_and_md5() {
        let dir = TempDir::new().unwrap();
        let mut fe = frontend(dir.path(), LimitsConfig::default(), Vec::new());
        fe.enable_md5();
        fe.open().unwrap();
        fe.write(&[1, 0, 0, 0, 2, 0, 0, 0, 7, 7], false);
        fe.close(CloseReason::Exiting);
        assert!(!fe.is_opened());
        assert_eq!(fe.close_reason(), CloseReason::Exiting);
        // Closing twice is harmless
        fe.close(CloseReason::Unknown);

        let bytes = std::fs::read(active(dir.path())).unwrap();
        let body = &bytes[header_len(&bytes)..];
        let header = LogHeader::open(&active(dir.path())).unwrap();
        assert_eq!(header.get("md5").unwrap(), hex::encode(Md5::digest(body)));

        assert_eq!(
            entry_ids(&bytes),
            vec![ID_SOURCE_DESC, ID_BASE, 1, ID_SOURCE_DESC, ID_BASE + 1]
        );
        let footer =
            &bytes[bytes.len() - encoded_string_len("reason") - encoded_string_len("EXITING")..];
        let mut reader = DataReader::new(footer);
        assert_eq!(reader.read_string().unwrap(), "reason");
        assert_eq!(reader.read_string().unwrap(), "EXITING");
    }

    #[test]
    fn test_file_too_big_reopens() {
        let dir = TempDir::new().unwrap();
        let limits = LimitsConfig {
            max_log_size: 1024,
            ..LimitsConfig::default()
        };
        let mut fe = frontend(dir.path(), limits, Vec::new());
        fe.open().unwrap();
        assert!(fe.take_session_started());

        let mut entry = vec![0u8; 2048];
        entry[..8].copy_from_slice(EntryHeader::new(ID_BASE + 2, 2040).as_bytes());
        fe.write(&entry, false);

        // The write went to the first file, a new one is open
        assert!(fe.is_opened());
        assert!(fe.take_session_started());
        let rotated = dir.path().join("log-1.bin");
        let old = std::fs::read(&rotated).unwrap();
        assert!(old.len() > 2048);
        assert_eq!(LogHeader::open(&active(dir.path())).unwrap().get("index"), Some("1"));
        assert!(old.ends_with(b"FILE_TOO_BIG\0"));
    }

    #[test]
    fn test_no_space_left_reopens_after_cleanup() {
        let dir = TempDir::new().unwrap();
        let free = Rc::new(Cell::new(1 << 30));
        let limits = LimitsConfig {
            min_free_space: 1 << 20,
            ..LimitsConfig::default()
        };
        let mut fe = frontend(dir.path(), limits, Vec::new()).with_gauge(Box::new(FakeGauge {
            free: Rc::clone(&free),
        }));
        fe.open().unwrap();
        fe.take_session_started();

        free.set(1000);
        fe.write(&[1, 0, 0, 0, 0, 0, 0, 0], false);
        assert!(fe.take_session_started());
        let old = std::fs::read(dir.path().join("log-1.bin")).unwrap();
        assert!(old.ends_with(b"NO_SPACE_LEFT\0"));
    }

    #[test]
    fn test_first_breached_limit_names_close() {
        let dir = TempDir::new().unwrap();
        let free = Rc::new(Cell::new(1 << 30));
        let limits = LimitsConfig {
            min_free_space: 1 << 20,
            max_used_space: 4096,
            ..LimitsConfig::default()
        };
        let mut fe = frontend(dir.path(), limits, Vec::new()).with_gauge(Box::new(FakeGauge {
            free: Rc::clone(&free),
        }));
        fe.open().unwrap();

        // Slightly under the free space limit, far over the quota
        free.set((1 << 20) - 10);
        fe.write(&vec![0u8; 8192], false);
        let old = std::fs::read(dir.path().join("log-1.bin")).unwrap();
        assert!(old.ends_with(b"NO_SPACE_LEFT\0"));
    }

    #[test]
    fn test_quota_alone_names_close() {
        let dir = TempDir::new().unwrap();
        let limits = LimitsConfig {
            max_used_space: 4096,
            ..LimitsConfig::default()
        };
        let mut fe = frontend(dir.path(), limits, Vec::new());
        fe.open().unwrap();

        fe.write(&vec![0u8; 8192], false);
        let old = std::fs::read(dir.path().join("log-1.bin")).unwrap();
        assert!(old.ends_with(b"QUOTA_REACHED\0"));
    }

    #[test]
    fn test_write_when_closed_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut fe = frontend(dir.path(), LimitsConfig::default(), Vec::new());
        fe.write(b"nothing", false);
        assert!(!active(dir.path()).exists());
        assert_eq!(fe.size(), 0);
    }

}
