//! Logging daemon: polls sources into the staging buffer and drives the
//! frontend

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::backend::{FileBackend, LogBackend};
use super::buffer::WriteBuffer;
use super::frontend::{FrontendOptions, LogFrontend};
use super::source::{
    DirectWriterId, LogManager, LogPlugin, LogSource, PluginRegistry, SourceDesc, SourceHandle,
};
use crate::config::Config;
use crate::storage::{CloseReason, EntryHeader, LogData, ENTRY_HEADER_SIZE, FILE_VERSION, ID_BASE};
use crate::Result;

/// Entry id of the internal header source
pub const HEADER_SOURCE_ID: u32 = ID_BASE;

/// Entry id of the internal footer source
pub const FOOTER_SOURCE_ID: u32 = ID_BASE + 1;

const FIRST_SOURCE_ID: u32 = ID_BASE + 2;

const DIRECT_WRITER_NAME: &str = "loggerd";

struct SourceEntry {
    desc: SourceDesc,
    source: Box<dyn LogSource>,
    deadline_ms: u64,
    pending_remove: bool,
}

/// Requests delivered to a running daemon from other tasks
#[derive(Clone, Default)]
pub struct LoggerdHandle {
    inner: Arc<HandleInner>,
}

#[derive(Default)]
struct HandleInner {
    flush: AtomicBool,
    rotate: AtomicBool,
    stop: AtomicBool,
    notify: Notify,
}

impl LoggerdHandle {
    /// Flush and sync at the next wakeup
    pub fn request_flush(&self) {
        self.inner.flush.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Start a new file at the next wakeup
    pub fn request_rotate(&self) {
        self.inner.rotate.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Poll everything one last time, close the file and return from
    /// [`Loggerd::run`]
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }
}

/// The logging daemon
///
/// Owns the sources, the staging buffer and the frontend. Everything runs on
/// a single task; other tasks talk to it through a [`LoggerdHandle`].
pub struct Loggerd {
    config: Config,
    frontend: LogFrontend,
    buffer: WriteBuffer,
    sources: Vec<SourceEntry>,
    direct_writers: Vec<SourceDesc>,
    plugins: Vec<Box<dyn LogPlugin>>,
    next_id: u32,
    period_ms: u32,
    last_flush_ms: u64,
    epoch: Instant,
    handle: LoggerdHandle,
}

impl Loggerd {
    /// Daemon writing to `config.output_dir`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = FileBackend::new(&config.output_dir);
        let frontend = Self::default_frontend(&config, Box::new(backend));
        Ok(Self::with_frontend(config, frontend))
    }

    /// Frontend with the internal header and footer sources, system
    /// properties taken from the configuration
    #[must_use]
    pub fn default_frontend(config: &Config, backend: Box<dyn LogBackend>) -> LogFrontend {
        let mut frontend = LogFrontend::new(
            FrontendOptions::from(config),
            backend,
            SourceDesc::new(HEADER_SOURCE_ID, "internal", "header", FILE_VERSION),
            SourceDesc::new(FOOTER_SOURCE_ID, "internal", "footer", FILE_VERSION),
        )
        .with_properties(Box::new(config.properties.clone()));
        if config.md5 {
            frontend.enable_md5();
        }
        frontend
    }

    /// Daemon driving an existing frontend
    #[must_use]
    pub fn with_frontend(config: Config, frontend: LogFrontend) -> Self {
        let buffer = WriteBuffer::new(config.buffer.flush_threshold, config.buffer.min_space);
        let period_ms = config.polling.period_ms;
        Self {
            config,
            frontend,
            buffer,
            sources: Vec::new(),
            direct_writers: Vec::new(),
            plugins: Vec::new(),
            next_id: FIRST_SOURCE_ID,
            period_ms,
            last_flush_ms: 0,
            epoch: Instant::now(),
            handle: LoggerdHandle::default(),
        }
    }

    /// Handle for signal handlers and other tasks
    #[must_use]
    pub fn handle(&self) -> LoggerdHandle {
        self.handle.clone()
    }

    /// The frontend, for inspection
    #[must_use]
    pub fn frontend(&self) -> &LogFrontend {
        &self.frontend
    }

    /// Current polling period
    #[must_use]
    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }

    /// Number of registered sources, removed ones excluded
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.iter().filter(|s| !s.pending_remove).count()
    }

    /// Instantiate and initialize the plugins listed in the configuration
    ///
    /// Unknown plugins and plugins failing to initialize are skipped.
    pub fn load_plugins(&mut self, registry: &PluginRegistry) {
        let wanted: Vec<(String, String)> = self
            .config
            .plugins
            .iter()
            .map(|(name, settings)| (name.clone(), settings.clone()))
            .collect();

        for (name, settings) in wanted {
            let Some(mut plugin) = registry.create(&name) else {
                warn!("unknown plugin '{name}'");
                continue;
            };
            plugin.set_settings(&settings);
            match plugin.init(self) {
                Ok(()) => {
                    info!("loaded plugin '{name}'");
                    self.plugins.push(plugin);
                }
                Err(e) => error!("plugin '{name}' failed to initialize: {e}"),
            }
        }
    }

    /// Open the first file and poll until stopped through the handle
    pub async fn run(&mut self) {
        self.open();

        let mut period = self.period_ms;
        let mut interval = new_interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = self.handle.inner.notify.notified() => {}
            }

            let inner = Arc::clone(&self.handle.inner);
            if inner.stop.swap(false, Ordering::AcqRel) {
                break;
            }
            if inner.flush.swap(false, Ordering::AcqRel) {
                self.flush("request");
            }
            if inner.rotate.swap(false, Ordering::AcqRel) {
                self.rotate();
            }

            self.poll_sources(false);

            if period != self.period_ms {
                period = self.period_ms;
                interval = new_interval(period);
            }
        }

        self.stop();
    }

    /// Open a new file if none is
    pub fn open(&mut self) {
        if self.frontend.is_opened() {
            return;
        }
        if let Err(e) = self.frontend.open() {
            error!("failed to open log: {e}");
            if self.frontend.is_opened() {
                self.frontend.close(CloseReason::Unknown);
            }
            self.buffer.reset();
            return;
        }
        self.check_session();
    }

    /// Flush the buffer, then close the file with `reason`
    pub fn close(&mut self, reason: CloseReason) {
        if !self.frontend.is_opened() {
            return;
        }
        self.buffer.flush(&mut self.frontend);
        self.frontend.close(reason);
        self.buffer.reset();
        // A rotation during the last flush is superseded by the close
        self.frontend.take_session_started();
    }

    /// Last poll, close the file and shut plugins down
    pub fn stop(&mut self) {
        if self.frontend.is_opened() {
            self.poll_sources(true);
            self.close(CloseReason::Exiting);
        }

        let mut plugins = std::mem::take(&mut self.plugins);
        for plugin in &mut plugins {
            plugin.shutdown(self);
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// A new file was opened, possibly in the middle of a write
    fn check_session(&mut self) {
        while self.frontend.take_session_started() {
            self.start_session();
        }
    }

    fn start_session(&mut self) {
        self.buffer.reset();
        for entry in &mut self.sources {
            entry.desc.start_session();
            entry.source.start_session();
        }
        for writer in &mut self.direct_writers {
            writer.start_session();
        }

        if !self.config.encrypted {
            return;
        }
        if let Err(e) = self
            .buffer
            .enable_encryption(&self.config.public_key, &mut self.frontend)
        {
            error!("cannot enable encryption: {e}");
            if self.frontend.is_opened() {
                self.frontend.close(CloseReason::Unknown);
            }
            self.buffer.reset();
        }
    }

    fn update_period(&mut self) {
        self.period_ms = self
            .sources
            .iter()
            .filter(|s| !s.pending_remove)
            .map(|s| s.source.period_ms())
            .fold(self.config.polling.period_ms, u32::min)
            .max(1);
    }

    fn push_source_description(&mut self, idx: usize) -> bool {
        let Self {
            sources,
            buffer,
            frontend,
            ..
        } = self;
        let desc = &mut sources[idx].desc;
        let Some(len) = desc.fill_description(buffer.write_head()) else {
            warn!("no room for description of {}", desc.full_name());
            return false;
        };
        desc.pending_description = false;
        buffer.push(len, frontend);
        true
    }

    /// Make sure the current file holds the description of source `idx`
    ///
    /// Pushing the description can flush the buffer and start a new file,
    /// which needs the description again.
    fn send_pending_description(&mut self, idx: usize) -> bool {
        for _ in 0..2 {
            if !self.sources[idx].desc.pending_description {
                return true;
            }
            if !self.push_source_description(idx) {
                return false;
            }
            self.check_session();
        }
        let desc = &self.sources[idx].desc;
        if desc.pending_description {
            warn!("{}: new file on each description, skipping", desc.full_name());
            return false;
        }
        true
    }

    /// Read as many entries as the source produces and fit, then push them
    /// at once
    fn push_source_data(&mut self, idx: usize, now_ms: u64) {
        let min_space = self.config.buffer.min_space;
        let Self {
            sources,
            buffer,
            frontend,
            ..
        } = self;
        let entry = &mut sources[idx];

        let mut total = 0;
        loop {
            let head = &mut buffer.write_head()[total..];
            let space = head.len();
            if space <= ENTRY_HEADER_SIZE {
                break;
            }
            let count = space.min(min_space);
            let (hdr, payload) = head[..count].split_at_mut(ENTRY_HEADER_SIZE);
            let mut data = LogData::new(payload);
            let len = entry.source.read_data(&mut data);
            if len == 0 {
                break;
            }
            hdr.copy_from_slice(EntryHeader::new(entry.desc.id, len as u32).as_bytes());
            total += ENTRY_HEADER_SIZE + len;
        }

        if total > 0 {
            buffer.push(total, frontend);
        }
        entry.deadline_ms = now_ms + u64::from(entry.source.period_ms());
    }

    fn check_pending_remove(&mut self) {
        self.sources.retain(|entry| {
            if entry.pending_remove {
                info!("removed source {}", entry.desc.full_name());
            }
            !entry.pending_remove
        });
    }
}

fn new_interval(period_ms: u32) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(u64::from(period_ms)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl LogManager for Loggerd {
    fn add_log_source(
        &mut self,
        source: Box<dyn LogSource>,
        plugin: &str,
        name: &str,
        version: u32,
    ) -> SourceHandle {
        let id = self.next_id;
        self.next_id += 1;
        let desc = SourceDesc::new(id, plugin, name, version);
        info!("added source {} (id {id})", desc.full_name());
        self.sources.push(SourceEntry {
            desc,
            source,
            deadline_ms: 0,
            pending_remove: false,
        });
        self.update_period();
        id
    }

    fn remove_log_source(&mut self, handle: SourceHandle) {
        match self.sources.iter_mut().find(|s| s.desc.id == handle) {
            Some(entry) => entry.pending_remove = true,
            None => warn!("remove of unknown source {handle}"),
        }
    }

    fn get_direct_writer(&mut self, plugin: &str, version: u32) -> DirectWriterId {
        if let Some(writer) = self
            .direct_writers
            .iter()
            .find(|w| w.plugin == plugin && w.version == version)
        {
            return writer.id;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.direct_writers
            .push(SourceDesc::new(id, plugin, DIRECT_WRITER_NAME, version));
        id
    }

    fn write_direct(&mut self, writer: DirectWriterId, buf: &[u8]) {
        if !self.frontend.is_opened() {
            return;
        }
        let Some(desc) = self.direct_writers.iter_mut().find(|w| w.id == writer) else {
            warn!("write through unknown direct writer {writer}");
            return;
        };

        let header = EntryHeader::new(desc.id, buf.len() as u32);
        if desc.pending_description {
            let description = desc.description();
            desc.pending_description = false;
            self.frontend.write_raw(&[
                IoSlice::new(&description),
                IoSlice::new(header.as_bytes()),
                IoSlice::new(buf),
            ]);
        } else {
            self.frontend
                .write_raw(&[IoSlice::new(header.as_bytes()), IoSlice::new(buf)]);
        }
    }

    fn flush(&mut self, reason: &str) {
        if !self.frontend.is_opened() {
            return;
        }
        info!("flushing and syncing, reason: {reason}");
        self.buffer.flush(&mut self.frontend);
        self.check_session();
        self.frontend.sync();
    }

    fn update_date(&mut self) -> Result<()> {
        self.frontend.update_date()
    }

    fn update_flight_id(&mut self, flight_id: &str) -> Result<()> {
        self.frontend.update_flight_id(flight_id)
    }

    fn update_ref_time(&mut self, message: &str, sec: i64, nsec: u32) -> Result<()> {
        self.frontend.update_ref_time(message, sec, nsec)
    }

    fn update_takeoff(&mut self, takeoff: bool) -> Result<()> {
        self.frontend.update_takeoff(takeoff)
    }

    fn update_gcs_name(&mut self, name: &str) -> Result<()> {
        self.frontend.update_gcs_name(name)
    }

    fn update_gcs_type(&mut self, gcs_type: &str) -> Result<()> {
        self.frontend.update_gcs_type(gcs_type)
    }

    fn update_extra_property(&mut self, key: &str, value: &str) -> Result<()> {
        self.frontend.update_extra_property(key, value)
    }

    fn rotate(&mut self) {
        self.close(CloseReason::Rotate);
        self.open();
    }

    fn enable_md5(&mut self) {
        self.frontend.enable_md5();
    }

    fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            self.open();
        } else {
            self.close(CloseReason::Disabled);
        }
    }

    fn poll_sources(&mut self, force: bool) {
        if !self.frontend.is_opened() {
            return;
        }

        let now = self.now_ms();
        self.update_period();
        let slow = Duration::from_millis(2 * u64::from(self.period_ms));

        for idx in 0..self.sources.len() {
            let entry = &self.sources[idx];
            if entry.pending_remove || (!force && now < entry.deadline_ms) {
                continue;
            }

            if !self.send_pending_description(idx) {
                continue;
            }

            let start = Instant::now();
            self.push_source_data(idx, now);
            self.check_session();

            let elapsed = start.elapsed();
            if elapsed > slow {
                warn!(
                    "source {} took {} ms",
                    self.sources[idx].desc.full_name(),
                    elapsed.as_millis()
                );
            }
        }

        let flush_period = u64::from(self.config.polling.flush_period_ms);
        if now >= self.last_flush_ms + flush_period {
            debug!("periodic flush");
            self.last_flush_ms = now;
            // No sync here, only explicit flush requests reach the disk
            self.buffer.flush(&mut self.frontend);
            self.check_session();
        }

        self.check_pending_remove();
    }
}
