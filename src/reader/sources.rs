//! Per-source reconstructors and the in-memory model they fill

use std::collections::BTreeMap;

use tracing::error;

use super::event::{Event, EventParam};
use super::telemetry::{TelemetryDecoder, TelemetryStore};
use crate::storage::DataReader;
use crate::{FdrError, Result};

/// Header field holding the monotonic reference time event
pub const REFTIME_MONOTONIC_KEY: &str = "reftime.monotonic";

/// Source identity read from a `SOURCE_DESC` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// Entry id of the source data
    pub id: u32,
    /// Data layout version
    pub version: u32,
    /// Plugin name
    pub plugin: String,
    /// Source name
    pub name: String,
}

impl SourceInfo {
    /// `plugin-name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.plugin, self.name)
    }
}

/// Key/value fields of an internal source
#[derive(Debug, Clone, Default)]
pub struct InternalDataSource {
    name: String,
    fields: BTreeMap<String, String>,
}

impl InternalDataSource {
    /// Empty source
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add or replace a field
    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    /// True if `key` was seen
    #[must_use]
    pub fn contains_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Value of `key`
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// All fields, sorted by key
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

/// Ordered list of events
#[derive(Debug, Clone, Default)]
pub struct EventDataSource {
    name: String,
    events: Vec<Event>,
}

impl EventDataSource {
    /// Empty source
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }

    /// Append an event
    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Events in file order
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }
}

/// Payloads of a source without a dedicated decoder, kept verbatim
#[derive(Debug, Clone, Default)]
pub struct RawDataSource {
    name: String,
    entries: Vec<Vec<u8>>,
}

impl RawDataSource {
    /// Empty source
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Entry payloads in file order
    #[must_use]
    pub fn entries(&self) -> &[Vec<u8>] {
        &self.entries
    }
}

/// Reconstructed content of one source, or one telemetry epoch
#[derive(Debug, Clone)]
pub enum DataSource {
    /// Header and footer fields
    Internal(InternalDataSource),
    /// Events
    Event(EventDataSource),
    /// Telemetry samples of one schema epoch
    Telemetry(TelemetryStore),
    /// Opaque payloads
    Raw(RawDataSource),
}

impl DataSource {
    /// Display name, with a `-N` suffix for repeated sources
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Internal(s) => &s.name,
            Self::Event(s) => &s.name,
            Self::Telemetry(s) => s.name(),
            Self::Raw(s) => &s.name,
        }
    }

    /// Short kind label
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Internal(_) => "internal",
            Self::Event(_) => "event",
            Self::Telemetry(_) => "telemetry",
            Self::Raw(_) => "raw",
        }
    }
}

/// Everything recovered from one log file
#[derive(Debug, Clone, Default)]
pub struct LogFileModel {
    data_sources: Vec<DataSource>,
    header: Option<usize>,
}

impl LogFileModel {
    /// Append a data source, returns its index
    pub fn add_data_source(&mut self, source: DataSource) -> usize {
        self.data_sources.push(source);
        self.data_sources.len() - 1
    }

    /// Data sources in creation order
    #[must_use]
    pub fn data_sources(&self) -> &[DataSource] {
        &self.data_sources
    }

    /// Data source at `idx`
    pub fn data_source_mut(&mut self, idx: usize) -> Option<&mut DataSource> {
        self.data_sources.get_mut(idx)
    }

    /// Fields of the `internal-header` source
    #[must_use]
    pub fn header(&self) -> Option<&InternalDataSource> {
        match self.data_sources.get(self.header?) {
            Some(DataSource::Internal(header)) => Some(header),
            _ => None,
        }
    }

    /// Reference time event stored in the header
    #[must_use]
    pub fn reference_time(&self) -> Option<Event> {
        let value = self.header()?.value(REFTIME_MONOTONIC_KEY)?;
        Event::from_string(value, 0)
    }

    /// Internal source called `name`
    #[must_use]
    pub fn internal(&self, name: &str) -> Option<&InternalDataSource> {
        self.data_sources.iter().find_map(|s| match s {
            DataSource::Internal(source) if source.name == name => Some(source),
            _ => None,
        })
    }

    /// Event source called `name`
    #[must_use]
    pub fn events(&self, name: &str) -> Option<&EventDataSource> {
        self.data_sources.iter().find_map(|s| match s {
            DataSource::Event(source) if source.name == name => Some(source),
            _ => None,
        })
    }

    /// Telemetry epochs called `name`, oldest first
    pub fn telemetry<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TelemetryStore> + 'a {
        self.data_sources.iter().filter_map(move |s| match s {
            DataSource::Telemetry(store) if store.name() == name => Some(store),
            _ => None,
        })
    }

    /// Raw source called `name`
    #[must_use]
    pub fn raw(&self, name: &str) -> Option<&RawDataSource> {
        self.data_sources.iter().find_map(|s| match s {
            DataSource::Raw(source) if source.name == name => Some(source),
            _ => None,
        })
    }

    pub(crate) fn set_header(&mut self, idx: usize) {
        self.header = Some(idx);
    }
}

const SETTING_BOOL: u8 = 0;
const SETTING_INT: u8 = 1;
const SETTING_DOUBLE: u8 = 2;
const SETTING_STRING: u8 = 3;

/// Decoder attached to a registered source id
#[derive(Debug)]
pub enum Reconstructor {
    /// `internal` plugin: key/value string pairs
    Internal {
        /// Index of the data source in the model
        store: usize,
        /// Source is the file header
        is_header: bool,
        /// First header entry decoded
        header_found: bool,
    },
    /// `settings` plugin: timestamped setting changes
    Settings {
        /// Index of the data source in the model
        store: usize,
    },
    /// `telemetry` plugin
    Telemetry(TelemetryDecoder),
    /// Any other plugin
    Raw {
        /// Index of the data source in the model
        store: usize,
    },
}

impl Reconstructor {
    /// Decoder for `info`, its data source named `name`
    pub fn create(info: &SourceInfo, name: String, model: &mut LogFileModel) -> Self {
        match info.plugin.as_str() {
            "internal" => {
                let store = model.add_data_source(DataSource::Internal(InternalDataSource::new(name)));
                let is_header = info.name == "header";
                if is_header {
                    model.set_header(store);
                }
                Self::Internal {
                    store,
                    is_header,
                    header_found: false,
                }
            }
            "settings" => Self::Settings {
                store: model.add_data_source(DataSource::Event(EventDataSource::new(name))),
            },
            "telemetry" => Self::Telemetry(TelemetryDecoder::new(name, model)),
            _ => Self::Raw {
                store: model.add_data_source(DataSource::Raw(RawDataSource::new(name))),
            },
        }
    }

    /// True once a header source decoded its entry
    #[must_use]
    pub fn is_header_found(&self) -> bool {
        matches!(
            self,
            Self::Internal {
                is_header: true,
                header_found: true,
                ..
            }
        )
    }

    /// Decode one entry payload
    ///
    /// # Errors
    ///
    /// Returns error on malformed payloads; what was decoded before the
    /// error is kept
    pub fn add_entry(&mut self, payload: &[u8], model: &mut LogFileModel) -> Result<()> {
        let mut reader = DataReader::new(payload);
        match self {
            Self::Internal {
                store,
                is_header,
                header_found,
            } => {
                let Some(DataSource::Internal(source)) = model.data_source_mut(*store) else {
                    return Ok(());
                };
                let result = read_fields(&mut reader, source);
                if *is_header {
                    *header_found = true;
                }
                result
            }
            Self::Settings { store } => {
                let Some(DataSource::Event(source)) = model.data_source_mut(*store) else {
                    return Ok(());
                };
                read_settings(&mut reader, source)
            }
            Self::Telemetry(decoder) => decoder.add_entry(&mut reader, model),
            Self::Raw { store } => {
                if let Some(DataSource::Raw(source)) = model.data_source_mut(*store) {
                    source.entries.push(payload.to_vec());
                }
                Ok(())
            }
        }
    }
}

fn read_fields(reader: &mut DataReader<'_>, source: &mut InternalDataSource) -> Result<()> {
    while !reader.is_empty() {
        let key = reader.read_string()?;
        let value = reader.read_string()?;
        source.add_field(key, value);
    }
    Ok(())
}

fn read_settings(reader: &mut DataReader<'_>, source: &mut EventDataSource) -> Result<()> {
    while !reader.is_empty() {
        let timestamp = reader.read_timespec_us()?;
        let name = reader.read_string()?;
        let type_num = reader.read_u8()?;

        let (kind, value) = match type_num {
            SETTING_BOOL => {
                let value = if reader.read_u8()? != 0 { "true" } else { "false" };
                ("BOOL", value.to_string())
            }
            SETTING_INT => ("INT", reader.read_i32()?.to_string()),
            SETTING_DOUBLE => ("DOUBLE", format!("{:.6}", reader.read_f64()?)),
            SETTING_STRING => ("STRING", format!("'{}'", reader.read_string()?)),
            _ => {
                error!("unknown setting type: {type_num}");
                return Err(FdrError::InvalidFormat(format!(
                    "unknown setting type {type_num}"
                )));
            }
        };

        source.add_event(Event::new(
            timestamp,
            "CHANGED",
            vec![
                EventParam::new("name", name),
                EventParam::new("type", kind),
                EventParam::new("value", value),
            ],
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LogData;

    fn info(plugin: &str, name: &str) -> SourceInfo {
        SourceInfo {
            id: 300,
            version: 1,
            plugin: plugin.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_internal_header() {
        let mut model = LogFileModel::default();
        let mut rec = Reconstructor::create(&info("internal", "header"), "header".into(), &mut model);
        assert!(!rec.is_header_found());

        let mut buf = [0u8; 128];
        let mut data = LogData::new(&mut buf);
        assert!(data.push_string("takeoff") && data.push_string("1"));
        assert!(data.push_string(REFTIME_MONOTONIC_KEY));
        assert!(data.push_string("EVT:TIME;date='2024-01-02';time='T000000+0000'"));
        let len = data.used();

        rec.add_entry(&buf[..len], &mut model).unwrap();
        assert!(rec.is_header_found());
        let header = model.header().unwrap();
        assert_eq!(header.value("takeoff"), Some("1"));
        assert!(header.contains_field(REFTIME_MONOTONIC_KEY));
        assert_eq!(
            model.reference_time().unwrap().param("date"),
            Some("2024-01-02")
        );
    }

    #[test]
    fn test_internal_truncated_keeps_fields() {
        let mut model = LogFileModel::default();
        let mut rec = Reconstructor::create(&info("internal", "footer"), "footer".into(), &mut model);
        let mut buf = [0u8; 64];
        let mut data = LogData::new(&mut buf);
        assert!(data.push_string("reason") && data.push_string("EXITING"));
        assert!(data.push_string("dangling"));
        let len = data.used();

        assert!(rec.add_entry(&buf[..len], &mut model).is_err());
        assert!(!rec.is_header_found());
        assert_eq!(model.internal("footer").unwrap().value("reason"), Some("EXITING"));
        assert!(model.header().is_none());
    }

    fn push_setting_prefix(data: &mut LogData<'_>, sec: u32, name: &str, type_num: u8) {
        assert!(data.push_u32(sec) && data.push_u32(500_000));
        assert!(data.push_string(name) && data.push_u8(type_num));
    }

    #[test]
    fn test_settings_events() {
        let mut model = LogFileModel::default();
        let mut rec = Reconstructor::create(&info("settings", "shs"), "shs".into(), &mut model);

        let mut buf = [0u8; 256];
        let mut data = LogData::new(&mut buf);
        push_setting_prefix(&mut data, 1, "a", SETTING_BOOL);
        assert!(data.push_u8(1));
        push_setting_prefix(&mut data, 2, "b", SETTING_INT);
        assert!(data.push_buffer(&(-3i32).to_le_bytes()));
        push_setting_prefix(&mut data, 3, "c", SETTING_DOUBLE);
        assert!(data.push_buffer(&1.5f64.to_le_bytes()));
        push_setting_prefix(&mut data, 4, "d", SETTING_STRING);
        assert!(data.push_string("on"));
        push_setting_prefix(&mut data, 5, "e", 9);
        let len = data.used();

        assert!(rec.add_entry(&buf[..len], &mut model).is_err());
        let events = model.events("shs").unwrap().events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].timestamp, 1_000_500);
        assert_eq!(events[0].name, "CHANGED");
        assert_eq!(events[0].param("value"), Some("true"));
        assert_eq!(events[1].param("value"), Some("-3"));
        assert_eq!(events[2].param("type"), Some("DOUBLE"));
        assert_eq!(events[2].param("value"), Some("1.500000"));
        assert_eq!(events[3].param("value"), Some("'on'"));
    }

    #[test]
    fn test_raw_kept_verbatim() {
        let mut model = LogFileModel::default();
        let mut rec = Reconstructor::create(&info("file", "dump"), "dump-1".into(), &mut model);
        rec.add_entry(b"abc", &mut model).unwrap();
        rec.add_entry(b"de", &mut model).unwrap();
        assert_eq!(model.raw("dump-1").unwrap().entries(), &[b"abc".to_vec(), b"de".to_vec()]);
        assert_eq!(model.data_sources()[0].kind(), "raw");
        assert_eq!(model.data_sources()[0].name(), "dump-1");
    }
}
