//! Built-in plugin sampling the system load average as telemetry
//!
//! The source payload uses the telemetry sub-format, so the reader rebuilds
//! one time series per variable.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::source::{LogManager, LogPlugin, LogSource};
use crate::storage::telemetry::{self, TelemetryHeader, VarDesc, VarType};
use crate::storage::LogData;
use crate::Result;

/// Name under which the plugin is registered
pub const PLUGIN_NAME: &str = "sysload";

/// Plugin name recorded in the source description
pub const SOURCE_PLUGIN: &str = "telemetry";

const SOURCE_VERSION: u32 = 1;
const DEFAULT_PATH: &str = "/proc/loadavg";
const DEFAULT_PERIOD_MS: u32 = 1000;

/// Plugin constructor for the registry
pub fn create() -> Box<dyn LogPlugin> {
    Box::new(SysloadPlugin::default())
}

struct SysloadPlugin {
    path: PathBuf,
    period_ms: u32,
}

impl Default for SysloadPlugin {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_PATH),
            period_ms: DEFAULT_PERIOD_MS,
        }
    }
}

impl LogPlugin for SysloadPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    /// `key=value` pairs separated by `|`: `period_ms`, `path`
    fn set_settings(&mut self, settings: &str) {
        for item in settings.split('|').filter(|s| !s.is_empty()) {
            match item.split_once('=') {
                Some(("period_ms", value)) => match value.parse() {
                    Ok(period) if period > 0 => self.period_ms = period,
                    _ => warn!("sysload: invalid period '{value}'"),
                },
                Some(("path", value)) => self.path = PathBuf::from(value),
                _ => warn!("sysload: unknown setting '{item}'"),
            }
        }
    }

    fn init(&mut self, manager: &mut dyn LogManager) -> Result<()> {
        let source = LoadAvgSource::new(self.path.clone(), self.period_ms);
        manager.add_log_source(Box::new(source), SOURCE_PLUGIN, PLUGIN_NAME, SOURCE_VERSION);
        Ok(())
    }
}

/// Encodes telemetry header and sample blocks for one fixed variable set
pub struct TelemetryEncoder {
    header: TelemetryHeader,
    metadata: Vec<u8>,
    header_logged: bool,
    seqnum: u32,
}

impl TelemetryEncoder {
    /// Encoder for samples laid out as `vars`, acquired every `period_ms`
    #[must_use]
    pub fn new(vars: &[VarDesc], sample_count: u32, period_ms: u32) -> Self {
        let metadata = telemetry::encode_metadata(vars);
        let sample_size = vars.iter().map(VarDesc::byte_len).sum::<u64>();
        Self {
            header: TelemetryHeader {
                sample_count,
                sample_size: sample_size as u32,
                sample_rate: period_ms.saturating_mul(1000),
                metadata_size: metadata.len() as u32,
            },
            metadata,
            header_logged: false,
            seqnum: 0,
        }
    }

    /// Bytes per sample
    #[must_use]
    pub fn sample_size(&self) -> usize {
        self.header.sample_size as usize
    }

    /// Send the header again before the next sample
    pub fn start_session(&mut self) {
        self.header_logged = false;
    }

    /// Push the header if needed, then one sample
    ///
    /// Returns false if the header did not fit or the sample was dropped.
    pub fn push(&mut self, data: &mut LogData<'_>, timestamp: Duration, sample: &[u8]) -> bool {
        debug_assert_eq!(sample.len(), self.sample_size());
        if !self.header_logged {
            if !self.header.push(data, &self.metadata) {
                return false;
            }
            self.header_logged = true;
        }

        let sec = timestamp.as_secs() as u32;
        if !telemetry::push_sample(data, sec, timestamp.subsec_nanos(), self.seqnum, sample) {
            return false;
        }
        self.seqnum = self.seqnum.wrapping_add(1);
        true
    }
}

/// Load figures from one read of `/proc/loadavg`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAvg {
    /// 1, 5 and 15 minute averages
    pub load: [f64; 3],
    /// Runnable tasks
    pub running: u32,
    /// Existing tasks
    pub total: u32,
}

impl LoadAvg {
    /// Parse `0.52 0.58 0.59 1/467 12345`
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let mut fields = content.split_whitespace();
        let mut load = [0.0; 3];
        for value in &mut load {
            *value = fields.next()?.parse().ok()?;
        }
        let (running, total) = fields.next()?.split_once('/')?;
        Some(Self {
            load,
            running: running.parse().ok()?,
            total: total.parse().ok()?,
        })
    }

    fn vars() -> Vec<VarDesc> {
        vec![
            VarDesc::new("load", VarType::F64, 8, 3),
            VarDesc::new("tasks.running", VarType::U32, 4, 1),
            VarDesc::new("tasks.total", VarType::U32, 4, 1),
        ]
    }

    fn encode(&self) -> Vec<u8> {
        let mut sample = Vec::with_capacity(32);
        for value in self.load {
            sample.extend_from_slice(&value.to_le_bytes());
        }
        sample.extend_from_slice(&self.running.to_le_bytes());
        sample.extend_from_slice(&self.total.to_le_bytes());
        sample
    }
}

/// Source sampling a loadavg file at most once per period
pub struct LoadAvgSource {
    path: PathBuf,
    period_ms: u32,
    encoder: TelemetryEncoder,
    epoch: Instant,
    last_sample: Option<Instant>,
}

impl LoadAvgSource {
    /// Source reading `path`
    #[must_use]
    pub fn new(path: PathBuf, period_ms: u32) -> Self {
        Self {
            path,
            period_ms,
            encoder: TelemetryEncoder::new(&LoadAvg::vars(), 1, period_ms),
            epoch: Instant::now(),
            last_sample: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.last_sample.map_or(true, |last| {
            now.duration_since(last) >= Duration::from_millis(u64::from(self.period_ms))
        })
    }
}

impl LogSource for LoadAvgSource {
    fn read_data(&mut self, data: &mut LogData<'_>) -> usize {
        let now = Instant::now();
        if !self.is_due(now) {
            return 0;
        }

        let load = match std::fs::read_to_string(&self.path) {
            Ok(content) => LoadAvg::parse(&content),
            Err(e) => {
                warn!("sysload: cannot read {}: {e}", self.path.display());
                None
            }
        };
        let Some(load) = load else {
            self.last_sample = Some(now);
            return 0;
        };

        if !self
            .encoder
            .push(data, now.duration_since(self.epoch), &load.encode())
        {
            debug!("sysload: not enough room for a sample");
        }
        self.last_sample = Some(now);
        data.used()
    }

    fn period_ms(&self) -> u32 {
        self.period_ms
    }

    fn start_session(&mut self) {
        self.encoder.start_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DataReader;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_loadavg() {
        let load = LoadAvg::parse("0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert_eq!(load.load, [0.52, 0.58, 0.59]);
        assert_eq!(load.running, 1);
        assert_eq!(load.total, 467);

        assert!(LoadAvg::parse("0.52 0.58").is_none());
        assert!(LoadAvg::parse("a b c 1/2").is_none());
    }

    #[test]
    fn test_encoder_header_once_per_session() {
        let vars = [VarDesc::new("x", VarType::U32, 4, 1)];
        let mut encoder = TelemetryEncoder::new(&vars, 1, 100);
        let mut buf = vec![0u8; 256];

        let mut data = LogData::new(&mut buf);
        assert!(encoder.push(&mut data, Duration::from_millis(1500), &7u32.to_le_bytes()));
        let first = data.used();
        assert_eq!(buf[0], telemetry::TAG_HEADER);

        let mut data = LogData::new(&mut buf);
        assert!(encoder.push(&mut data, Duration::from_millis(1600), &8u32.to_le_bytes()));
        assert_eq!(data.used(), telemetry::sample_block_len(4));
        assert_eq!(buf[0], telemetry::TAG_SAMPLE);
        let mut reader = DataReader::new(&buf[1..]);
        assert_eq!(reader.read_u32().unwrap(), 1);
        assert_eq!(reader.read_u32().unwrap(), 600_000_000);
        assert_eq!(reader.read_u32().unwrap(), 1);
        assert_eq!(reader.read_u32().unwrap(), 8);

        encoder.start_session();
        let mut data = LogData::new(&mut buf);
        assert!(encoder.push(&mut data, Duration::from_secs(2), &9u32.to_le_bytes()));
        assert_eq!(data.used(), first);
    }

    #[test]
    fn test_encoder_header_does_not_fit() {
        let vars = [VarDesc::new("x", VarType::U32, 4, 1)];
        let mut encoder = TelemetryEncoder::new(&vars, 1, 100);
        let mut buf = vec![0u8; 16];
        let mut data = LogData::new(&mut buf);
        assert!(!encoder.push(&mut data, Duration::ZERO, &[0; 4]));
        assert_eq!(data.used(), 0);
    }

    #[test]
    fn test_source_samples_once_per_period() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"1.00 2.00 3.00 4/100 999\n").unwrap();
        let mut source = LoadAvgSource::new(file.path().to_path_buf(), 60_000);

        let mut buf = vec![0u8; 1024];
        let mut data = LogData::new(&mut buf);
        let len = source.read_data(&mut data);
        assert!(len > telemetry::sample_block_len(32));

        // Not due again before the period elapses
        let mut data = LogData::new(&mut buf);
        assert_eq!(source.read_data(&mut data), 0);
    }

    #[test]
    fn test_settings() {
        let mut plugin = SysloadPlugin::default();
        plugin.set_settings("period_ms=250|path=/tmp/load|bogus");
        assert_eq!(plugin.period_ms, 250);
        assert_eq!(plugin.path, PathBuf::from("/tmp/load"));

        plugin.set_settings("period_ms=0");
        assert_eq!(plugin.period_ms, 250);
    }
}
