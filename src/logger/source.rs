//! Producer-facing interfaces and source descriptors

use std::collections::BTreeMap;

use crate::storage::{EntryHeader, LogData, ENTRY_HEADER_SIZE, ID_SOURCE_DESC};
use crate::Result;

/// Identity of a source inside one log file
///
/// The description entry must precede the first data entry of the source in
/// every session; `pending_description` tracks that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDesc {
    /// Entry id used for the data of this source
    pub id: u32,
    /// Plugin name
    pub plugin: String,
    /// Source name within the plugin
    pub name: String,
    /// Layout version of the data
    pub version: u32,
    /// Description must be written before the next data entry
    pub pending_description: bool,
}

impl SourceDesc {
    /// New descriptor, pending description
    pub fn new(id: u32, plugin: impl Into<String>, name: impl Into<String>, version: u32) -> Self {
        Self {
            id,
            plugin: plugin.into(),
            name: name.into(),
            version,
            pending_description: true,
        }
    }

    /// `plugin-name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.plugin, self.name)
    }

    /// Write the complete `SOURCE_DESC` entry into `buf`
    ///
    /// Returns the entry size, or `None` if it does not fit.
    pub fn fill_description(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return None;
        }
        let (hdr, payload) = buf.split_at_mut(ENTRY_HEADER_SIZE);
        let mut data = LogData::new(payload);
        let ok = data.push_u32(self.id)
            && data.push_u32(self.version)
            && data.push_string(&self.plugin)
            && data.push_string(&self.name);
        if !ok {
            return None;
        }
        let len = data.used();
        hdr.copy_from_slice(EntryHeader::new(ID_SOURCE_DESC, len as u32).as_bytes());
        Some(ENTRY_HEADER_SIZE + len)
    }

    /// The `SOURCE_DESC` entry as an owned buffer
    #[must_use]
    pub fn description(&self) -> Vec<u8> {
        let payload_len = 2 * std::mem::size_of::<u32>()
            + crate::storage::encoded_string_len(&self.plugin)
            + crate::storage::encoded_string_len(&self.name);
        let mut buf = vec![0u8; ENTRY_HEADER_SIZE + payload_len];
        let len = self.fill_description(&mut buf).unwrap_or(0);
        buf.truncate(len);
        buf
    }

    /// A new file was opened, describe the source again
    pub fn start_session(&mut self) {
        self.pending_description = true;
    }
}

/// Data producer polled by the daemon
pub trait LogSource {
    /// Fill `data` with the payload of one entry, return the bytes written
    ///
    /// Returning 0 means nothing to log right now.
    fn read_data(&mut self, data: &mut LogData<'_>) -> usize;

    /// Desired polling period
    fn period_ms(&self) -> u32;

    /// A new log file was opened
    fn start_session(&mut self) {}
}

/// Handle of a source registered with [`LogManager::add_log_source`]
pub type SourceHandle = u32;

/// Handle of a writer returned by [`LogManager::get_direct_writer`]
pub type DirectWriterId = u32;

/// Services offered by the daemon to plugins
pub trait LogManager {
    /// Register a polled source
    fn add_log_source(
        &mut self,
        source: Box<dyn LogSource>,
        plugin: &str,
        name: &str,
        version: u32,
    ) -> SourceHandle;

    /// Remove a source at the end of the current poll
    fn remove_log_source(&mut self, handle: SourceHandle);

    /// Writer bypassing buffering and compression, shared per
    /// `(plugin, version)`
    fn get_direct_writer(&mut self, plugin: &str, version: u32) -> DirectWriterId;

    /// Write one entry through a direct writer
    fn write_direct(&mut self, writer: DirectWriterId, buf: &[u8]);

    /// Flush buffered data and sync the file
    fn flush(&mut self, reason: &str);

    /// Rewrite the `date` header field with the current time
    ///
    /// # Errors
    ///
    /// Returns error if the new value does not fit the reserved field
    fn update_date(&mut self) -> Result<()>;

    /// Rewrite the `control.flight.uuid` header field
    ///
    /// # Errors
    ///
    /// Returns error if the new value does not fit the reserved field
    fn update_flight_id(&mut self, flight_id: &str) -> Result<()>;

    /// Rewrite the reference time header fields
    ///
    /// # Errors
    ///
    /// Returns error if the new value does not fit the reserved field
    fn update_ref_time(&mut self, message: &str, sec: i64, nsec: u32) -> Result<()>;

    /// Rewrite the `takeoff` header field
    ///
    /// # Errors
    ///
    /// Returns error if the new value does not fit the reserved field
    fn update_takeoff(&mut self, takeoff: bool) -> Result<()>;

    /// Rewrite the `gcs.name` header field
    ///
    /// # Errors
    ///
    /// Returns error if the new value does not fit the reserved field
    fn update_gcs_name(&mut self, name: &str) -> Result<()>;

    /// Rewrite the `gcs.type` header field
    ///
    /// # Errors
    ///
    /// Returns error if the new value does not fit the reserved field
    fn update_gcs_type(&mut self, gcs_type: &str) -> Result<()>;

    /// Rewrite a configured extra header field
    ///
    /// # Errors
    ///
    /// Returns error if the new value does not fit the reserved field
    fn update_extra_property(&mut self, key: &str, value: &str) -> Result<()>;

    /// Close the current file and start a new one
    fn rotate(&mut self);

    /// Compute the MD5 of the next files
    fn enable_md5(&mut self);

    /// Start or stop logging
    fn set_enabled(&mut self, enabled: bool);

    /// Poll due sources, or all of them when `force` is set
    fn poll_sources(&mut self, force: bool);
}

/// Statically linked plugin
pub trait LogPlugin {
    /// Plugin name
    fn name(&self) -> &str;

    /// Apply a plugin-specific settings string
    fn set_settings(&mut self, _settings: &str) {}

    /// Register sources with the manager
    ///
    /// # Errors
    ///
    /// Returns error if the plugin cannot start
    fn init(&mut self, manager: &mut dyn LogManager) -> Result<()>;

    /// Called before the daemon exits
    fn shutdown(&mut self, _manager: &mut dyn LogManager) {}
}

/// Plugin constructor
pub type PluginFactory = fn() -> Box<dyn LogPlugin>;

/// Plugins available by name
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<&'static str, PluginFactory>,
}

impl PluginRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the plugins shipped with the crate
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::sysload::PLUGIN_NAME, super::sysload::create);
        registry
    }

    /// Add or replace a plugin
    pub fn register(&mut self, name: &'static str, factory: PluginFactory) {
        self.factories.insert(name, factory);
    }

    /// Instantiate `name`
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<dyn LogPlugin>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}
