//! A connected link and the state its event loops share with callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use devlink_frame::control::{self, MAX_STREAM_NAME_LEN};
use devlink_frame::{
    align_up, split, validate_packet_length, EventKind, Frame, FrameConfig, FrameReader,
    FrameWriter, FLAG_LAST, UNASSIGNED_STREAM,
};
use devlink_transport::LinkStream;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::dispatcher::{open_frame, Completion, Dispatcher, Reply, Waiter};
use crate::error::{LinkError, Result};
use crate::firmware::DeviceProgram;
use crate::profile::{LinkProfiler, ProfileSnapshot};
use crate::registry::{CloseStep, Released, StreamEntry, StreamRegistry};
use crate::types::{
    FillSide, LinkId, LinkRole, LinkState, Packet, PacketId, PacketLengthTarget, StreamId,
};

/// State owned jointly by a [`Link`] and its event loops.
pub(crate) struct LinkShared {
    pub(crate) id: LinkId,
    pub(crate) role: LinkRole,
    pub(crate) config: LinkConfig,
    pub(crate) program: DeviceProgram,
    pub(crate) registry: StreamRegistry,
    state: Mutex<LinkState>,
    host_packet_length: AtomicU32,
    device_packet_length: AtomicU32,
    pending: Mutex<HashMap<u32, Waiter>>,
    next_event_id: AtomicU32,
    tx: Mutex<Option<Sender<Vec<Frame>>>>,
    transport: LinkStream,
}

impl LinkShared {
    pub fn state(&self) -> LinkState {
        *self.lock_state()
    }

    fn set_state(&self, state: LinkState) {
        *self.lock_state() = state;
    }

    /// Connecting or connected: requests may still be issued.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            LinkState::Connecting | LinkState::Connected
        )
    }

    pub fn next_event_id(&self) -> u32 {
        self.next_event_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn packet_length(&self, target: PacketLengthTarget) -> u32 {
        match target {
            PacketLengthTarget::Host => self.host_packet_length.load(Ordering::Acquire),
            PacketLengthTarget::Device => self.device_packet_length.load(Ordering::Acquire),
        }
    }

    pub fn store_packet_length(&self, target: PacketLengthTarget, len: u32) {
        match target {
            PacketLengthTarget::Host => self.host_packet_length.store(len, Ordering::Release),
            PacketLengthTarget::Device => self.device_packet_length.store(len, Ordering::Release),
        }
    }

    /// Queue a batch of frames for the transmit loop.
    pub fn submit(&self, frames: Vec<Frame>) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(sender) => sender.send(frames).map_err(|_| LinkError::LinkDown),
            None => Err(LinkError::LinkDown),
        }
    }

    fn register(&self, event_id: u32, waiter: Waiter) -> Result<()> {
        let mut pending = self.lock_pending();
        // Checked under the pending lock so teardown cannot miss the entry.
        if !self.is_active() {
            return Err(LinkError::LinkDown);
        }
        pending.insert(event_id, waiter);
        Ok(())
    }

    fn forget(&self, event_id: u32) {
        self.lock_pending().remove(&event_id);
    }

    /// Route a response frame to whoever issued the request.
    pub fn resolve(&self, frame: Frame) {
        let waiter = self.lock_pending().remove(&frame.event_id);
        match waiter {
            Some(Waiter::Caller(completion)) => completion.complete(Reply::Frame(frame)),
            Some(Waiter::Detached { stream, aligned }) => {
                if frame.is_nack() {
                    warn!(link = %self.id, %stream, "peer rejected packet");
                    if let Some(entry) = self.registry.find(stream) {
                        entry.return_remote(aligned);
                    }
                }
            }
            None => debug!(
                link = %self.id,
                kind = %frame.kind,
                event = frame.event_id,
                "response without a waiter"
            ),
        }
    }

    /// Send `frames` and wait for the response to `event_id`.
    pub fn request(&self, frames: Vec<Frame>, event_id: u32, timeout: Duration) -> Result<Frame> {
        let completion = Arc::new(Completion::new()?);
        self.register(event_id, Waiter::Caller(Arc::clone(&completion)))?;
        if let Err(err) = self.submit(frames) {
            self.forget(event_id);
            return Err(err);
        }
        let reply = completion.wait(timeout);
        if reply.is_err() {
            self.forget(event_id);
        }
        reply
    }

    /// Cut a packet into `Write` frames using this side's packet length.
    pub fn data_frames(&self, stream: StreamId, event_id: u32, data: Bytes) -> Result<Vec<Frame>> {
        let chunks = split(data, self.packet_length(self.role.send_target()))?;
        Ok(chunks
            .map(|chunk| {
                let frame = Frame::new(EventKind::Write, stream.0, event_id, chunk.data);
                if chunk.last {
                    frame.with_flags(FLAG_LAST)
                } else {
                    frame
                }
            })
            .collect())
    }

    /// Send a packet whose space is already reserved, without waiting for
    /// the acknowledgement.
    pub fn send_detached(&self, stream: StreamId, data: Bytes, aligned: usize) -> Result<()> {
        let event_id = self.next_event_id();
        let frames = self.data_frames(stream, event_id, data)?;
        self.register(event_id, Waiter::Detached { stream, aligned })?;
        self.submit(frames).inspect_err(|_| self.forget(event_id))
    }

    /// Tell the peer about freed space and finish a close if this was the
    /// last queued packet.
    pub fn after_release(&self, entry: &StreamEntry, released: Released) {
        if released.freed > 0 {
            let release = Frame::new(
                EventKind::Release,
                entry.id().0,
                self.next_event_id(),
                control::encode_u32(released.freed as u32),
            );
            if let Err(err) = self.submit(vec![release]) {
                debug!(link = %self.id, stream = %entry.id(), error = %err, "release not sent");
            }
        }
        if released.finalize {
            self.finalize_stream(entry);
        }
    }

    fn finalize_stream(&self, entry: &StreamEntry) {
        entry.finalize();
        self.registry.remove(entry.id());
        info!(link = %self.id, stream = %entry.id(), name = entry.name(), "stream closed");
    }

    /// First half of a reset: stop accepting work, fail every waiter and
    /// drop all streams. Returns `false` if the link was already going down.
    pub fn teardown(&self, notify_peer: bool) -> bool {
        {
            let mut state = self.lock_state();
            if matches!(*state, LinkState::Resetting | LinkState::Closed) {
                return false;
            }
            *state = LinkState::Resetting;
        }

        if notify_peer {
            let reset = Frame::control(EventKind::Reset, 0, self.next_event_id());
            if let Err(err) = self.submit(vec![reset]) {
                warn!(link = %self.id, error = %err, "could not notify peer of reset");
            }
        }
        // Ends the transmit loop once the queue is drained.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();

        let waiters: Vec<Waiter> = self.lock_pending().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            if let Waiter::Caller(completion) = waiter {
                completion.complete(Reply::LinkDown);
            }
        }

        let streams = self.registry.drain();
        for entry in &streams {
            entry.fail_link();
        }
        debug!(link = %self.id, streams = streams.len(), "link torn down");
        true
    }

    /// Second half of a reset: release the transport.
    pub fn finish(&self) {
        if let Err(err) = self.transport.shutdown() {
            debug!(link = %self.id, error = %err, "transport shutdown failed");
        }
        self.set_state(LinkState::Closed);
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u32, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connected link multiplexing named streams over one transport.
///
/// Every method takes `&self`; a link is shared between threads through
/// `Arc<Link>`. Dropping the last handle resets the link.
pub struct Link {
    shared: Arc<LinkShared>,
    dispatcher: Dispatcher,
    profiler: LinkProfiler,
}

impl Link {
    /// Run the protocol over an already-open transport.
    pub fn connect_stream(
        id: LinkId,
        stream: LinkStream,
        role: LinkRole,
        config: &LinkConfig,
    ) -> Result<Arc<Self>> {
        Self::start(id, stream, role, config, DeviceProgram::Idle)
    }

    /// Run the device side of a link with a firmware program.
    pub fn connect_device(
        id: LinkId,
        stream: LinkStream,
        config: &LinkConfig,
        program: DeviceProgram,
    ) -> Result<Arc<Self>> {
        Self::start(id, stream, LinkRole::Device, config, program)
    }

    fn start(
        id: LinkId,
        stream: LinkStream,
        role: LinkRole,
        config: &LinkConfig,
        program: DeviceProgram,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let frame_config = FrameConfig {
            max_payload_size: config.max_packet_size,
            read_timeout: None,
            write_timeout: Some(config.response_timeout),
        };
        let reader = FrameReader::with_config_link(stream.try_clone()?, frame_config.clone())?;
        let writer = FrameWriter::with_config_link(stream.try_clone()?, frame_config)?;
        let transport_name = stream.transport_name();

        let (sender, queue) = mpsc::channel();
        let shared = Arc::new(LinkShared {
            id,
            role,
            config: config.clone(),
            program,
            registry: StreamRegistry::new(config.max_streams),
            state: Mutex::new(LinkState::Uninitialized),
            host_packet_length: AtomicU32::new(config.host_packet_length),
            device_packet_length: AtomicU32::new(config.device_packet_length),
            pending: Mutex::new(HashMap::new()),
            next_event_id: AtomicU32::new(1),
            tx: Mutex::new(Some(sender)),
            transport: stream,
        });

        shared.set_state(LinkState::Connecting);
        let dispatcher = Dispatcher::start(&shared, reader, writer, queue)?;
        let link = Arc::new(Self {
            shared,
            dispatcher,
            profiler: LinkProfiler::default(),
        });

        if role == LinkRole::Host {
            // The device frames its sends with the length we announce.
            let len = config.device_packet_length;
            link.shared.submit(vec![Frame::new(
                EventKind::SetPacketLength,
                0,
                link.shared.next_event_id(),
                control::encode_u32(len),
            )])?;
        }
        link.shared.set_state(LinkState::Connected);
        info!(
            link = %id,
            role = role.as_str(),
            transport = transport_name,
            program = %program,
            "link up"
        );
        Ok(link)
    }

    pub fn id(&self) -> LinkId {
        self.shared.id
    }

    pub fn role(&self) -> LinkRole {
        self.shared.role
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn program(&self) -> DeviceProgram {
        self.shared.program
    }

    pub fn packet_length(&self, target: PacketLengthTarget) -> u32 {
        self.shared.packet_length(target)
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.shared.registry.ids()
    }

    /// Liveness check. Returns the round-trip time.
    pub fn ping(&self, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        let event_id = self.shared.next_event_id();
        self.shared.request(
            vec![Frame::control(EventKind::Ping, 0, event_id)],
            event_id,
            timeout,
        )?;
        Ok(start.elapsed())
    }

    /// Open (or re-open) the stream `name` with room for `size` bytes,
    /// rounded up to 64. Re-opening adopts the new capacity.
    pub fn open_stream(&self, name: &str, size: u32) -> Result<StreamId> {
        self.ensure_connected()?;
        if name.is_empty() || name.len() > MAX_STREAM_NAME_LEN {
            return Err(LinkError::InvalidArgument(format!(
                "stream name must be 1 to {MAX_STREAM_NAME_LEN} bytes"
            )));
        }
        if size == 0 {
            return Err(LinkError::InvalidArgument(
                "stream size must be positive".to_string(),
            ));
        }

        let shared = &self.shared;
        let timeout = shared.config.response_timeout;
        let event_id = shared.next_event_id();
        let entry = match shared.role {
            LinkRole::Host => {
                let (entry, created) = shared.registry.open_allocated(name, size, true)?;
                let request = open_frame(entry.id().0, event_id, name, size)?;
                match shared.request(vec![request], event_id, timeout) {
                    Ok(reply) if !reply.is_nack() => entry,
                    outcome => {
                        if created {
                            if let Some(entry) = shared.registry.remove(entry.id()) {
                                entry.finalize();
                            }
                        }
                        return Err(match outcome {
                            Ok(_) => LinkError::ResourceExhausted(format!(
                                "device refused stream {name}"
                            )),
                            Err(err) => err,
                        });
                    }
                }
            }
            LinkRole::Device => {
                let request = open_frame(UNASSIGNED_STREAM, event_id, name, size)?;
                let reply = shared.request(vec![request], event_id, timeout)?;
                if reply.is_nack() {
                    return Err(LinkError::ResourceExhausted(format!(
                        "host refused stream {name}"
                    )));
                }
                let id = StreamId(reply.stream_id);
                match shared.registry.open_assigned(id, name, size, true) {
                    Ok((entry, _)) => entry,
                    Err(err) => {
                        let close =
                            Frame::control(EventKind::CloseStream, id.0, shared.next_event_id());
                        let _ = shared.submit(vec![close]);
                        return Err(err);
                    }
                }
            }
        };

        info!(
            link = %shared.id,
            stream = %entry.id(),
            name,
            capacity = entry.capacity(),
            "stream open"
        );
        Ok(entry.id())
    }

    /// Close a stream. Its queue stays readable until every packet has
    /// been released, then the slot is freed.
    pub fn close_stream(&self, stream: StreamId) -> Result<()> {
        self.ensure_connected()?;
        let entry = self.shared.registry.get(stream)?;
        let step = entry.begin_close();
        if step == CloseStep::AlreadyClosing {
            return Ok(());
        }
        let close = Frame::control(EventKind::CloseStream, stream.0, self.shared.next_event_id());
        if let Err(err) = self.shared.submit(vec![close]) {
            debug!(link = %self.shared.id, %stream, error = %err, "close not sent");
        }
        if step == CloseStep::Finalize {
            self.shared.finalize_stream(&entry);
        } else {
            debug!(link = %self.shared.id, %stream, "stream closing; packets still queued");
        }
        Ok(())
    }

    /// Write one packet, blocking while the peer's buffer is full.
    pub fn write(&self, stream: StreamId, data: &[u8]) -> Result<()> {
        self.write_inner(stream, data, None)
    }

    /// Like [`write`](Self::write) but gives up if buffer space does not
    /// free up within `timeout`. Nothing has been sent when this times out.
    pub fn write_timeout(&self, stream: StreamId, data: &[u8], timeout: Duration) -> Result<()> {
        self.write_inner(stream, data, Some(timeout))
    }

    fn write_inner(&self, stream: StreamId, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.ensure_connected()?;
        let started = Instant::now();
        let shared = &self.shared;
        let entry = shared.registry.get(stream)?;

        if data.len() > shared.config.max_packet_size {
            return Err(LinkError::ResourceExhausted(format!(
                "packet of {} bytes exceeds the {} byte limit",
                data.len(),
                shared.config.max_packet_size
            )));
        }
        let aligned = align_up(data.len());
        if aligned > entry.capacity() {
            return Err(LinkError::ResourceExhausted(format!(
                "packet needs {aligned} bytes but stream {stream} holds {}",
                entry.capacity()
            )));
        }

        entry.reserve_remote(aligned, timeout)?;

        let event_id = shared.next_event_id();
        let frames = match shared.data_frames(stream, event_id, Bytes::copy_from_slice(data)) {
            Ok(frames) => frames,
            Err(err) => {
                entry.return_remote(aligned);
                return Err(err);
            }
        };
        let chunks = frames.len();

        match shared.request(frames, event_id, shared.config.response_timeout) {
            Ok(ack) if ack.is_nack() => {
                entry.return_remote(aligned);
                Err(LinkError::ResourceExhausted(format!(
                    "peer rejected packet on stream {stream}"
                )))
            }
            Ok(_) => {
                debug!(link = %shared.id, %stream, size = data.len(), chunks, "packet written");
                self.profiler.record_write(data.len(), started.elapsed());
                Ok(())
            }
            Err(LinkError::Timeout(after)) => {
                // The packet may still land; its space stays reserved until released.
                warn!(link = %shared.id, %stream, "no acknowledgement for write");
                Err(LinkError::Timeout(after))
            }
            Err(err) => {
                entry.return_remote(aligned);
                Err(err)
            }
        }
    }

    /// Oldest packet not yet read, blocking until one arrives.
    pub fn read(&self, stream: StreamId) -> Result<Packet> {
        self.read_inner(stream, None)
    }

    /// Like [`read`](Self::read) with a deadline. A timed-out read leaves
    /// the queue untouched.
    pub fn read_timeout(&self, stream: StreamId, timeout: Duration) -> Result<Packet> {
        self.read_inner(stream, Some(timeout))
    }

    fn read_inner(&self, stream: StreamId, timeout: Option<Duration>) -> Result<Packet> {
        self.ensure_connected()?;
        let started = Instant::now();
        let packet = self.shared.registry.get(stream)?.read(timeout)?;
        self.profiler.record_read(packet.size(), started.elapsed());
        Ok(packet)
    }

    /// Start counting packets and bytes moved through this link.
    ///
    /// Returns `false` when profiling was already running.
    pub fn prof_start(&self) -> bool {
        let started = self.profiler.start();
        if started {
            debug!(link = %self.shared.id, "profiling started");
        }
        started
    }

    /// Stop counting. The totals are kept; returns `false` if not running.
    pub fn prof_stop(&self) -> bool {
        self.profiler.stop()
    }

    pub fn profile(&self) -> ProfileSnapshot {
        self.profiler.snapshot()
    }

    /// Log the counters through `tracing` and return them.
    pub fn prof_print(&self) -> ProfileSnapshot {
        self.profiler.print(self.shared.id)
    }

    /// Release the oldest packet on the stream, returning its space.
    pub fn release(&self, stream: StreamId) -> Result<()> {
        self.ensure_connected()?;
        let entry = self.shared.registry.get(stream)?;
        let released = entry.release_front()?;
        self.shared.after_release(&entry, released);
        Ok(())
    }

    /// Release exactly `packet`, leaving older packets queued.
    pub fn release_specific(&self, stream: StreamId, packet: PacketId) -> Result<()> {
        self.ensure_connected()?;
        let entry = self.shared.registry.get(stream)?;
        let released = entry.release_id(packet)?;
        self.shared.after_release(&entry, released);
        Ok(())
    }

    /// Current fill level in bytes (multiples of 64, never above capacity).
    pub fn fill_level(&self, stream: StreamId, side: FillSide) -> Result<usize> {
        self.ensure_connected()?;
        Ok(self.shared.registry.get(stream)?.fill(side))
    }

    pub fn stream_capacity(&self, stream: StreamId) -> Result<usize> {
        self.ensure_connected()?;
        Ok(self.shared.registry.get(stream)?.capacity())
    }

    /// Change a packet length for subsequent framing. The length the peer
    /// sends with is announced to it.
    pub fn set_packet_length(&self, target: PacketLengthTarget, len: u32) -> Result<()> {
        validate_packet_length(len)?;
        if target != self.shared.role.send_target() {
            self.ensure_connected()?;
            self.shared.submit(vec![Frame::new(
                EventKind::SetPacketLength,
                0,
                self.shared.next_event_id(),
                control::encode_u32(len),
            )])?;
        }
        self.shared.store_packet_length(target, len);
        debug!(link = %self.shared.id, ?target, len, "packet length set");
        Ok(())
    }

    /// Tear the link down: fail every waiter, drop all streams, stop the
    /// event loops and release the transport. Idempotent; the peer is told
    /// on a best-effort basis.
    pub fn reset(&self) -> Result<()> {
        let initiated = self.shared.teardown(true);
        self.dispatcher.join_tx();
        self.shared.finish();
        self.dispatcher.join_rx();
        if initiated {
            info!(link = %self.shared.id, "link reset");
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.shared.state() == LinkState::Connected {
            Ok(())
        } else {
            Err(LinkError::LinkDown)
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let _ = self.reset();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.shared.state())
            .field("streams", &self.shared.registry.len())
            .finish()
    }
}
