//! Reading side: file parsing and per-source reconstruction

pub mod event;
pub mod parser;
pub mod sources;
pub mod telemetry;

pub use event::{Event, EventParam};
pub use parser::{load_file, load_info, FileParser};
pub use sources::{
    DataSource, EventDataSource, InternalDataSource, LogFileModel, RawDataSource, SourceInfo,
};
pub use telemetry::{DataSample, DataSet, DataSetDesc, TelemetryStore};
