//! Writing side: daemon, sources, buffering and file management

pub mod backend;
pub mod buffer;
pub mod crypto;
pub mod daemon;
pub mod frontend;
pub mod source;
pub mod sysload;

pub use backend::{FileBackend, LogBackend, ACTIVE_FILE_NAME};
pub use buffer::{EntryWriter, WriteBuffer};
pub use daemon::{Loggerd, LoggerdHandle};
pub use frontend::{FrontendOptions, FsGauge, LogFrontend, PropertyProvider, SpaceGauge};
pub use source::{
    DirectWriterId, LogManager, LogPlugin, LogSource, PluginRegistry, SourceDesc, SourceHandle,
};
