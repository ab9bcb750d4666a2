//! Telemetry reconstruction: schema epochs and the sample store

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, info, warn};

use super::sources::{DataSource, LogFileModel};
use crate::storage::telemetry::{self, TelemetryHeader, VarDesc, VarType, METADATA_MAGIC};
use crate::storage::{DataReader, MAX_ALLOC_SIZE};
use crate::{FdrError, Result};

const VALUE_SIZE: usize = std::mem::size_of::<f64>();

/// Column of a telemetry store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetDesc {
    /// Column name
    pub name: String,
    /// Number of items, more than one for arrays
    pub item_count: u32,
    /// Size of one item in the raw sample
    pub size: u32,
    /// Type code from the metadata
    pub type_code: u32,
}

impl DataSetDesc {
    /// New column description
    pub fn new(name: impl Into<String>, item_count: u32, size: u32, type_code: u32) -> Self {
        Self {
            name: name.into(),
            item_count,
            size,
            type_code,
        }
    }

    /// True for columns with several items
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.item_count >= 2
    }
}

/// One value of a column
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataSample {
    /// Monotonic time in microseconds
    pub timestamp: i64,
    /// Decoded value
    pub value: f64,
}

/// Samples of one schema epoch
///
/// Every sample is stored as `time_us`, `seqnum` and one `f64` per item, in
/// a single growing byte stream. Lookups read one value at a computed offset.
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    name: String,
    sample_rate: u32,
    descs: Vec<DataSetDesc>,
    // name -> (index in descs, byte offset in a sample)
    columns: HashMap<String, (usize, usize)>,
    value_count: usize,
    sample_size: usize,
    timestamps: Vec<i64>,
    backing: BytesMut,
    rejected: usize,
}

impl TelemetryStore {
    /// Empty store without columns
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sample_rate: 0,
            descs: Vec::new(),
            columns: HashMap::new(),
            value_count: 0,
            sample_size: 0,
            timestamps: Vec::new(),
            backing: BytesMut::new(),
            rejected: 0,
        }
    }

    /// Store name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once columns are set
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.descs.is_empty()
    }

    /// Declare the columns, after the `time_us` and `seqnum` ones
    ///
    /// A duplicate name is ignored but still takes its room in samples.
    pub fn set_data_set_descs(&mut self, descs: &[DataSetDesc]) {
        debug_assert!(self.descs.is_empty());
        let mut offset = 0;
        let mut value_count = 0;
        let synthetic = [
            DataSetDesc::new("time_us", 1, VALUE_SIZE as u32, VarType::F64 as u32),
            DataSetDesc::new("seqnum", 1, VALUE_SIZE as u32, VarType::F64 as u32),
        ];
        for desc in synthetic.iter().chain(descs) {
            if self.columns.contains_key(&desc.name) {
                warn!(
                    "Ignoring duplicate data set '{}' in '{}'",
                    desc.name, self.name
                );
            } else {
                self.columns
                    .insert(desc.name.clone(), (self.descs.len(), offset));
                self.descs.push(desc.clone());
            }
            value_count += desc.item_count as usize;
            offset += desc.item_count as usize * VALUE_SIZE;
        }
        self.value_count = value_count;
        self.sample_size = offset;
    }

    /// Set the acquisition rate
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    /// Acquisition rate
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bytes per stored sample
    #[must_use]
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Columns, synthetic ones first
    #[must_use]
    pub fn data_set_descs(&self) -> &[DataSetDesc] {
        &self.descs
    }

    /// Stored samples
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Timestamps of the stored samples
    #[must_use]
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// Samples dropped for going back in time
    #[must_use]
    pub fn rejected_count(&self) -> usize {
        self.rejected
    }

    /// Append a sample, `values` excluding the synthetic columns
    ///
    /// Returns false if the sample is older than the last one stored or has
    /// the wrong number of values.
    pub fn add_sample(&mut self, timestamp: i64, seqnum: u32, values: &[f64]) -> bool {
        if let Some(&last) = self.timestamps.last() {
            if timestamp < last {
                warn!(
                    "Unordered timestamp for '{}': {timestamp} < {last}",
                    self.name
                );
                self.rejected += 1;
                return false;
            }
        }
        if values.len() + 2 != self.value_count {
            warn!(
                "Unable to write sample for '{}': {} values, expected {}",
                self.name,
                values.len(),
                self.value_count.saturating_sub(2)
            );
            return false;
        }

        self.backing.reserve(self.sample_size);
        self.backing.put_f64_le(timestamp as f64);
        self.backing.put_f64_le(f64::from(seqnum));
        for &value in values {
            self.backing.put_f64_le(value);
        }
        self.timestamps.push(timestamp);
        true
    }

    /// Column called `name`
    #[must_use]
    pub fn data_set(&self, name: &str) -> Option<DataSet<'_>> {
        let &(idx, offset) = self.columns.get(name)?;
        Some(DataSet {
            desc: &self.descs[idx],
            store: self,
            offset,
        })
    }

    fn value_at(&self, offset: usize) -> Option<f64> {
        let mut slice = self.backing.get(offset..offset + VALUE_SIZE)?;
        Some(slice.get_f64_le())
    }
}

/// Read access to one column of a [`TelemetryStore`]
#[derive(Debug, Clone, Copy)]
pub struct DataSet<'a> {
    desc: &'a DataSetDesc,
    store: &'a TelemetryStore,
    offset: usize,
}

impl DataSet<'_> {
    /// Column description
    #[must_use]
    pub fn desc(&self) -> &DataSetDesc {
        self.desc
    }

    /// Items per sample
    #[must_use]
    pub fn item_count(&self) -> u32 {
        self.desc.item_count
    }

    /// Samples in the store
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.store.sample_count()
    }

    /// Item `item_idx` of sample `sample_idx`
    ///
    /// An item past the column width reads as 0.0; `None` if the sample does
    /// not exist.
    #[must_use]
    pub fn sample(&self, sample_idx: usize, item_idx: u32) -> Option<DataSample> {
        let timestamp = *self.store.timestamps.get(sample_idx)?;
        if item_idx >= self.desc.item_count {
            return Some(DataSample {
                timestamp,
                value: 0.0,
            });
        }
        let offset =
            sample_idx * self.store.sample_size + self.offset + item_idx as usize * VALUE_SIZE;
        let value = self.store.value_at(offset).unwrap_or(0.0);
        Some(DataSample { timestamp, value })
    }
}

/// Decoder of a `telemetry` source
///
/// Feeds the current epoch store of the model; a header announcing a
/// different variable set opens a new store with the same name.
#[derive(Debug)]
pub struct TelemetryDecoder {
    name: String,
    store: usize,
    header: TelemetryHeader,
    is_tlm: bool,
    epoch_valid: bool,
    vars: Vec<VarDesc>,
    values: Vec<f64>,
}

impl TelemetryDecoder {
    /// Decoder writing to `model`
    pub fn new(name: impl Into<String>, model: &mut LogFileModel) -> Self {
        let name = name.into();
        let store = model.add_data_source(DataSource::Telemetry(TelemetryStore::new(&name)));
        Self {
            name,
            store,
            header: TelemetryHeader::default(),
            is_tlm: false,
            epoch_valid: false,
            vars: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Decode the header and sample blocks of one entry
    ///
    /// # Errors
    ///
    /// Returns error on a truncated block or an unknown tag; blocks decoded
    /// before it are kept
    pub fn add_entry(&mut self, reader: &mut DataReader<'_>, model: &mut LogFileModel) -> Result<()> {
        while !reader.is_empty() {
            let tag = reader.read_u8()?;
            match tag {
                telemetry::TAG_HEADER => {
                    self.header = match TelemetryHeader::read(reader) {
                        Ok(header) => header,
                        Err(FdrError::TooBig { size, .. }) => {
                            error!("Tlm '{}': header size too big: {size}", self.name);
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    let metadata_size = self.header.metadata_size as usize;
                    if metadata_size == 0 {
                        continue;
                    }
                    if reader.remaining() < metadata_size {
                        error!("Tlm '{}': truncated header", self.name);
                        break;
                    }
                    let metadata = reader.read_bytes(metadata_size)?;
                    self.read_metadata(metadata, model)?;
                }
                telemetry::TAG_SAMPLE => {
                    let timestamp = reader.read_timespec_us()?;
                    let seqnum = reader.read_u32()?;
                    let sample = reader.read_bytes(self.header.sample_size as usize)?;
                    if self.is_tlm {
                        self.add_sample(timestamp, seqnum, sample, model);
                    }
                }
                _ => {
                    error!("Tlm '{}': unknown tag: {tag}", self.name);
                    return Err(FdrError::InvalidFormat(format!("unknown telemetry tag {tag}")));
                }
            }
        }
        Ok(())
    }

    fn read_metadata(&mut self, metadata: &[u8], model: &mut LogFileModel) -> Result<()> {
        let Some(magic) = metadata.get(..4) else {
            return Ok(());
        };
        self.is_tlm = magic == METADATA_MAGIC.to_le_bytes();
        if !self.is_tlm {
            return Ok(());
        }

        let vars = telemetry::decode_var_descs(&metadata[4..])?;
        let same_names = vars.len() == self.vars.len()
            && vars.iter().zip(&self.vars).all(|(a, b)| a.name == b.name);

        let configured = self
            .store_mut(model)
            .is_some_and(|store| store.is_configured());
        if configured && same_names {
            self.is_tlm = self.epoch_valid;
            return Ok(());
        }
        if configured {
            info!("Tlm '{}': new description different from previous", self.name);
            self.store =
                model.add_data_source(DataSource::Telemetry(TelemetryStore::new(&self.name)));
        }
        self.vars = vars;
        self.epoch_valid = self.setup_header(model);
        self.is_tlm = self.epoch_valid;
        Ok(())
    }

    fn setup_header(&mut self, model: &mut LogFileModel) -> bool {
        let size: u64 = self.vars.iter().map(VarDesc::byte_len).sum();
        if size > u64::from(self.header.sample_size) {
            error!(
                "Tlm '{}': invalid description size: {size}({})",
                self.name, self.header.sample_size
            );
            return false;
        }

        // One f64 per item and per synthetic column in each stored row
        let items: u64 = self.vars.iter().map(|v| u64::from(v.count)).sum();
        let row_size = (items + 2) * std::mem::size_of::<f64>() as u64;
        if row_size > MAX_ALLOC_SIZE as u64 {
            error!("Tlm '{}': too many items: {items}", self.name);
            return false;
        }

        let descs: Vec<DataSetDesc> = self
            .vars
            .iter()
            .map(|v| DataSetDesc::new(&v.name, v.count, v.size, v.type_code))
            .collect();
        let sample_rate = self.header.sample_rate;
        let Some(store) = self.store_mut(model) else {
            return false;
        };
        store.set_sample_rate(sample_rate);
        store.set_data_set_descs(&descs);
        self.values = Vec::with_capacity(descs.iter().map(|d| d.item_count as usize).sum());
        true
    }

    fn add_sample(&mut self, timestamp: i64, seqnum: u32, sample: &[u8], model: &mut LogFileModel) {
        self.values.clear();
        let mut off = 0;
        for var in &self.vars {
            let size = var.size as usize;
            let var_type = var.var_type();
            for _ in 0..var.count {
                let value = match (var_type, sample.get(off..off + size)) {
                    (Some(var_type), Some(raw)) => var_type.to_f64(raw),
                    _ => 0.0,
                };
                self.values.push(value);
                off += size;
            }
        }
        if let Some(store) = self.store_mut(model) {
            store.add_sample(timestamp, seqnum, &self.values);
        }
    }

    fn store_mut<'m>(&self, model: &'m mut LogFileModel) -> Option<&'m mut TelemetryStore> {
        match model.data_source_mut(self.store) {
            Some(DataSource::Telemetry(store)) => Some(store),
            _ => None,
        }
    }
}
