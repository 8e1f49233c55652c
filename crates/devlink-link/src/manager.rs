//! Link manager: device discovery, boot, connect and reset.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use devlink_transport::{DeviceBackend, DeviceDescriptor, DeviceRequirements, Protocol, StateFilter};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::link::Link;
use crate::profile::ProfileSnapshot;
use crate::types::{InitStatus, LinkId, LinkRole, LinkState, PacketLengthTarget};

#[derive(Default)]
struct LinkTable {
    next_id: u32,
    links: BTreeMap<LinkId, Arc<Link>>,
}

/// Owns every link of a process and the backends devices are found through.
pub struct LinkManager {
    config: LinkConfig,
    initialized: AtomicBool,
    profiling: AtomicBool,
    backends: RwLock<Vec<Arc<dyn DeviceBackend>>>,
    table: Mutex<LinkTable>,
}

impl LinkManager {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            initialized: AtomicBool::new(false),
            profiling: AtomicBool::new(false),
            backends: RwLock::new(Vec::new()),
            table: Mutex::new(LinkTable::default()),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Add a source of devices. Backends are searched in registration order.
    pub fn register_backend(&self, backend: Arc<dyn DeviceBackend>) {
        debug!(backend = backend.name(), protocol = %backend.protocol(), "backend registered");
        self.backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(backend);
    }

    /// Validate the configuration and mark the subsystem ready.
    pub fn initialize(&self) -> Result<InitStatus> {
        self.config.validate()?;
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(InitStatus::AlreadyInitialized);
        }
        info!(
            backends = self.backends().len(),
            max_links = self.config.max_links,
            "link subsystem initialized"
        );
        Ok(InitStatus::Initialized)
    }

    /// Every device across all backends that matches `state` and `requirements`.
    ///
    /// A backend that fails to enumerate is skipped.
    pub fn discover(
        &self,
        state: StateFilter,
        requirements: &DeviceRequirements,
    ) -> Result<Vec<DeviceDescriptor>> {
        self.ensure_initialized()?;
        Ok(self
            .matching(state, requirements)
            .into_iter()
            .map(|(_, device)| device)
            .collect())
    }

    /// First device matching `state` and `requirements`.
    pub fn find_first(
        &self,
        state: StateFilter,
        requirements: &DeviceRequirements,
    ) -> Result<DeviceDescriptor> {
        self.ensure_initialized()?;
        self.matching(state, requirements)
            .into_iter()
            .next()
            .map(|(_, device)| device)
            .ok_or_else(|| not_found(requirements))
    }

    /// Connect to the first booted device matching `requirements` and
    /// confirm it answers a ping.
    pub fn connect(&self, requirements: &DeviceRequirements) -> Result<LinkId> {
        self.ensure_initialized()?;
        {
            let mut table = self.lock_table();
            // Links closed by their peer are retired here.
            table
                .links
                .retain(|_, link| link.state() != LinkState::Closed);
            if table.links.len() >= self.config.max_links {
                return Err(LinkError::ResourceExhausted(format!(
                    "all {} link slots are in use",
                    self.config.max_links
                )));
            }
        }

        let (backend, device) = self
            .matching(StateFilter::Booted, requirements)
            .into_iter()
            .next()
            .ok_or_else(|| not_found(requirements))?;

        let stream = backend
            .open(&device)
            .map_err(|err| LinkError::ConnectFailed(format!("{}: {err}", device.name)))?;

        let id = self.allocate_id();
        let link = Link::connect_stream(id, stream, LinkRole::Host, &self.config)
            .map_err(|err| LinkError::ConnectFailed(format!("{}: {err}", device.name)))?;

        match link.ping(self.config.connect_timeout) {
            Ok(rtt) => debug!(link = %id, device = %device.name, ?rtt, "device answered ping"),
            Err(err) => {
                let _ = link.reset();
                return Err(LinkError::ConnectFailed(format!(
                    "{} did not answer ping: {err}",
                    device.name
                )));
            }
        }

        if self.profiling.load(Ordering::Acquire) {
            link.prof_start();
        }
        self.lock_table().links.insert(id, Arc::clone(&link));
        info!(
            link = %id,
            device = %device.name,
            backend = backend.name(),
            "connected"
        );
        Ok(id)
    }

    /// The link object for `id`.
    pub fn link(&self, id: LinkId) -> Result<Arc<Link>> {
        self.lock_table()
            .links
            .get(&id)
            .cloned()
            .ok_or_else(|| LinkError::NotFound(format!("link {id}")))
    }

    /// Ids of the links this manager still holds.
    pub fn link_ids(&self) -> Vec<LinkId> {
        self.lock_table().links.keys().copied().collect()
    }

    /// Load `firmware` onto `device` through the backend that reports it.
    pub fn boot(&self, device: &DeviceDescriptor, firmware: &[u8]) -> Result<()> {
        self.ensure_initialized()?;
        let backend = self
            .backends()
            .into_iter()
            .find(|backend| {
                backend
                    .discover()
                    .map(|devices| devices.iter().any(|d| d.name == device.name))
                    .unwrap_or(false)
            })
            .ok_or_else(|| LinkError::DeviceNotFound(device.name.clone()))?;
        backend.boot(device, firmware)?;
        info!(
            device = %device.name,
            backend = backend.name(),
            size = firmware.len(),
            "device booted"
        );
        Ok(())
    }

    /// Like [`boot`](Self::boot) with the image read from `path`.
    pub fn boot_file(&self, device: &DeviceDescriptor, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let firmware = std::fs::read(path).map_err(|err| {
            LinkError::InvalidArgument(format!("cannot read firmware {}: {err}", path.display()))
        })?;
        self.boot(device, &firmware)
    }

    /// Reset one link and drop it from the table.
    ///
    /// Resetting an id that was already retired succeeds.
    pub fn reset(&self, id: LinkId) -> Result<()> {
        let link = {
            let mut table = self.lock_table();
            match table.links.remove(&id) {
                Some(link) => link,
                None if id.0 < table.next_id => return Ok(()),
                None => return Err(LinkError::NotFound(format!("link {id}"))),
            }
        };
        link.reset()?;
        debug!(link = %id, "link retired");
        Ok(())
    }

    /// Reset every link and empty the table.
    pub fn reset_all(&self) -> Result<()> {
        let links = std::mem::take(&mut self.lock_table().links);
        let count = links.len();
        let mut first_err = None;
        for link in links.into_values() {
            if let Err(err) = link.reset() {
                first_err.get_or_insert(err);
            }
        }
        debug!(links = count, "all links reset");
        first_err.map_or(Ok(()), Err)
    }

    pub fn set_packet_length(
        &self,
        id: LinkId,
        target: PacketLengthTarget,
        len: u32,
    ) -> Result<()> {
        self.link(id)?.set_packet_length(target, len)
    }

    /// Start profiling every held link and each link connected afterwards.
    pub fn prof_start(&self) {
        self.profiling.store(true, Ordering::Release);
        for link in self.links() {
            link.prof_start();
        }
        info!("link profiling started");
    }

    pub fn prof_stop(&self) {
        self.profiling.store(false, Ordering::Release);
        for link in self.links() {
            link.prof_stop();
        }
        info!("link profiling stopped");
    }

    /// Log the counters of every held link and return them, ordered by id.
    pub fn prof_print(&self) -> Vec<(LinkId, ProfileSnapshot)> {
        self.links()
            .into_iter()
            .map(|link| (link.id(), link.prof_print()))
            .collect()
    }

    fn links(&self) -> Vec<Arc<Link>> {
        self.lock_table().links.values().cloned().collect()
    }

    fn matching(
        &self,
        state: StateFilter,
        requirements: &DeviceRequirements,
    ) -> Vec<(Arc<dyn DeviceBackend>, DeviceDescriptor)> {
        let mut found = Vec::new();
        for backend in self.backends() {
            if requirements.protocol != Protocol::Any
                && backend.protocol() != requirements.protocol
            {
                continue;
            }
            let devices = match backend.discover() {
                Ok(devices) => devices,
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, "device discovery failed");
                    continue;
                }
            };
            for device in devices {
                if state.accepts(device.state) && requirements.matches(&device) {
                    found.push((Arc::clone(&backend), device));
                }
            }
        }
        found
    }

    fn backends(&self) -> Vec<Arc<dyn DeviceBackend>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn allocate_id(&self) -> LinkId {
        let mut table = self.lock_table();
        let id = LinkId(table.next_id);
        table.next_id = table.next_id.wrapping_add(1);
        id
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LinkError::InvalidState(
                "link subsystem is not initialized".to_string(),
            ))
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, LinkTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        let _ = self.reset_all();
    }
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkManager")
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field("backends", &self.backends().len())
            .field("links", &self.lock_table().links.len())
            .finish()
    }
}

fn not_found(requirements: &DeviceRequirements) -> LinkError {
    let mut parts = Vec::new();
    if let Some(name) = &requirements.name {
        parts.push(format!("name={name}"));
    }
    parts.push(format!("protocol={}", requirements.protocol));
    if let Some(platform) = &requirements.platform {
        parts.push(format!("platform={platform}"));
    }
    LinkError::DeviceNotFound(parts.join(" "))
}

