//! Per-link event loops.
//!
//! Each link runs two threads. `devlink-rx-<id>` reads frames from the
//! transport, reassembles packets into stream queues and answers control
//! events. `devlink-tx-<id>` drains a FIFO queue of frame batches onto the
//! transport; a batch is written back to back, so a packet's chunks are
//! never interleaved with another write. Delivery order on a link is decided
//! by these two loops only.

use std::io::ErrorKind;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use devlink_frame::{
    align_up, control, EventKind, Frame, FrameError, FrameReader, FrameWriter, Reassembler,
    FLAG_NACK, UNASSIGNED_STREAM,
};
use devlink_sync::{RefSemaphore, SyncError};
use devlink_transport::LinkStream;
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};
use crate::firmware::DeviceProgram;
use crate::link::LinkShared;
use crate::registry::StreamEntry;
use crate::types::{LinkRole, StreamId};

/// Outcome delivered to a request waiter.
#[derive(Debug)]
pub(crate) enum Reply {
    Frame(Frame),
    LinkDown,
}

/// One-shot rendezvous between a caller awaiting a response and the
/// receive loop.
#[derive(Debug)]
pub(crate) struct Completion {
    signal: RefSemaphore,
    reply: Mutex<Option<Reply>>,
}

impl Completion {
    pub fn new() -> Result<Self> {
        Ok(Self {
            signal: RefSemaphore::new(0)?,
            reply: Mutex::new(None),
        })
    }

    /// Store the first reply and wake the waiter. Later replies are dropped.
    pub fn complete(&self, reply: Reply) {
        let mut slot = self.reply.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reply);
            drop(slot);
            let _ = self.signal.post();
        }
    }

    pub fn wait(&self, timeout: Duration) -> Result<Frame> {
        match self.signal.wait_timeout(timeout) {
            Ok(()) => {}
            Err(SyncError::Timeout(_)) => return Err(LinkError::Timeout(timeout)),
            Err(err) => return Err(err.into()),
        }
        let reply = self
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match reply {
            Some(Reply::Frame(frame)) => Ok(frame),
            Some(Reply::LinkDown) | None => Err(LinkError::LinkDown),
        }
    }
}

/// Who is interested in the response to an outstanding request.
#[derive(Debug)]
pub(crate) enum Waiter {
    Caller(Arc<Completion>),
    /// A write nobody waits on; a rejection returns its reserved space.
    Detached { stream: StreamId, aligned: usize },
}

/// Join handles of a link's two event loops.
pub(crate) struct Dispatcher {
    rx: Mutex<Option<JoinHandle<()>>>,
    tx: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(
        shared: &Arc<LinkShared>,
        reader: FrameReader<LinkStream>,
        writer: FrameWriter<LinkStream>,
        queue: Receiver<Vec<Frame>>,
    ) -> Result<Self> {
        let id = shared.id;

        let tx = {
            let shared = Arc::clone(shared);
            thread::Builder::new()
                .name(format!("devlink-tx-{id}"))
                .spawn(move || tx_loop(&shared, writer, queue))
                .map_err(devlink_transport::TransportError::Io)?
        };
        let rx = {
            let shared = Arc::clone(shared);
            thread::Builder::new()
                .name(format!("devlink-rx-{id}"))
                .spawn(move || rx_loop(&shared, reader))
                .map_err(devlink_transport::TransportError::Io)?
        };

        Ok(Self {
            rx: Mutex::new(Some(rx)),
            tx: Mutex::new(Some(tx)),
        })
    }

    pub fn join_tx(&self) {
        join(&self.tx);
    }

    pub fn join_rx(&self) {
        join(&self.rx);
    }
}

fn join(slot: &Mutex<Option<JoinHandle<()>>>) {
    let handle = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(handle) = handle {
        // A loop tearing its own link down cannot wait for itself.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("link event loop panicked");
        }
    }
}

fn tx_loop(shared: &LinkShared, mut writer: FrameWriter<LinkStream>, queue: Receiver<Vec<Frame>>) {
    for batch in queue.iter() {
        if let Err(err) = writer.write_batch(&batch) {
            if shared.is_active() {
                warn!(link = %shared.id, error = %err, "link send failed; closing link");
            }
            shared.teardown(false);
            shared.finish();
            return;
        }
    }
    debug!(link = %shared.id, "transmit loop stopped");
}

fn rx_loop(shared: &LinkShared, mut reader: FrameReader<LinkStream>) {
    let mut reassembler = Reassembler::new(shared.config.max_packet_size);
    loop {
        match reader.read_frame() {
            Ok(frame) => {
                debug!(
                    link = %shared.id,
                    kind = %frame.kind,
                    stream = frame.stream_id,
                    event = frame.event_id,
                    len = frame.payload.len(),
                    "event received"
                );
                if handle_frame(shared, &mut reassembler, frame) == Flow::Stop {
                    break;
                }
            }
            Err(FrameError::Io(err)) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if shared.is_active() {
                    warn!(link = %shared.id, error = %err, "link receive failed; closing link");
                }
                shared.teardown(false);
                shared.finish();
                break;
            }
        }
    }
    debug!(link = %shared.id, "receive loop stopped");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

fn handle_frame(shared: &LinkShared, reassembler: &mut Reassembler, frame: Frame) -> Flow {
    match frame.kind {
        EventKind::Write => on_write(shared, reassembler, frame),
        EventKind::Release => on_release(shared, &frame),
        EventKind::OpenStream => on_open_stream(shared, &frame),
        EventKind::CloseStream => {
            reassembler.discard(frame.stream_id);
            match shared.registry.find(StreamId(frame.stream_id)) {
                Some(entry) => {
                    info!(
                        link = %shared.id,
                        stream = %entry.id(),
                        name = entry.name(),
                        "peer closed stream"
                    );
                    entry.mark_peer_closed();
                }
                None => {
                    debug!(link = %shared.id, stream = frame.stream_id, "close for unknown stream")
                }
            }
        }
        EventKind::Ping => {
            respond(shared, Frame::control(EventKind::PingResponse, 0, frame.event_id));
        }
        EventKind::SetPacketLength => on_set_packet_length(shared, &frame),
        EventKind::Reset => {
            info!(link = %shared.id, "peer reset link");
            shared.teardown(false);
            shared.finish();
            return Flow::Stop;
        }
        EventKind::WriteResponse | EventKind::OpenStreamResponse | EventKind::PingResponse => {
            shared.resolve(frame);
        }
    }
    Flow::Continue
}

fn on_write(shared: &LinkShared, reassembler: &mut Reassembler, frame: Frame) {
    let stream = StreamId(frame.stream_id);
    let last = frame.is_last();
    let data = match reassembler.push(frame.stream_id, frame.payload, last) {
        Ok(Some(data)) => data,
        Ok(None) => return,
        Err(err) => {
            warn!(link = %shared.id, %stream, error = %err, "rejecting packet");
            acknowledge(shared, stream, frame.event_id, false);
            return;
        }
    };

    let Some(entry) = shared.registry.find(stream) else {
        warn!(link = %shared.id, %stream, "data for unknown stream");
        acknowledge(shared, stream, frame.event_id, false);
        return;
    };

    let size = data.len();
    match entry.deliver(data) {
        Ok(packet) => {
            debug!(link = %shared.id, %stream, %packet, size, "packet queued");
            if shared.program == DeviceProgram::Echo {
                pump_echo(shared, &entry);
            }
            acknowledge(shared, stream, frame.event_id, true);
        }
        Err(err) => {
            warn!(link = %shared.id, %stream, error = %err, "rejecting packet");
            acknowledge(shared, stream, frame.event_id, false);
        }
    }
}

fn acknowledge(shared: &LinkShared, stream: StreamId, event_id: u32, accepted: bool) {
    let mut ack = Frame::control(EventKind::WriteResponse, stream.0, event_id);
    if !accepted {
        ack = ack.with_flags(FLAG_NACK);
    }
    respond(shared, ack);
}

fn on_release(shared: &LinkShared, frame: &Frame) {
    let bytes = match control::decode_u32(&frame.payload, "RELEASE") {
        Ok(bytes) => bytes as usize,
        Err(err) => {
            warn!(link = %shared.id, error = %err, "ignoring release");
            return;
        }
    };
    if let Some(entry) = shared.registry.find(StreamId(frame.stream_id)) {
        entry.return_remote(bytes);
        if shared.program == DeviceProgram::Echo {
            pump_echo(shared, &entry);
        }
    }
}

fn on_open_stream(shared: &LinkShared, frame: &Frame) {
    let refuse = |reason: &dyn std::fmt::Display| {
        warn!(link = %shared.id, %reason, "refusing stream open");
        respond(
            shared,
            Frame::control(EventKind::OpenStreamResponse, frame.stream_id, frame.event_id)
                .with_flags(FLAG_NACK),
        );
    };

    let (name, size) = match control::decode_open_stream(&frame.payload) {
        Ok(open) => open,
        Err(err) => return refuse(&err),
    };

    let opened = match shared.role {
        LinkRole::Host if frame.stream_id == UNASSIGNED_STREAM => {
            shared.registry.open_allocated(&name, size, false)
        }
        LinkRole::Host => Err(LinkError::InvalidState(format!(
            "device proposed stream id {} for {name}",
            frame.stream_id
        ))),
        LinkRole::Device => {
            shared
                .registry
                .open_assigned(StreamId(frame.stream_id), &name, size, false)
        }
    };

    match opened {
        Ok((entry, created)) => {
            if created {
                info!(
                    link = %shared.id,
                    stream = %entry.id(),
                    name = %name,
                    capacity = entry.capacity(),
                    "peer opened stream"
                );
            }
            respond(
                shared,
                Frame::new(
                    EventKind::OpenStreamResponse,
                    entry.id().0,
                    frame.event_id,
                    control::encode_u32(entry.capacity() as u32),
                ),
            );
        }
        Err(err) => refuse(&err),
    }
}

fn on_set_packet_length(shared: &LinkShared, frame: &Frame) {
    let len = control::decode_u32(&frame.payload, "SET_PACKET_LENGTH")
        .and_then(devlink_frame::validate_packet_length);
    match len {
        Ok(len) => {
            shared.store_packet_length(shared.role.send_target(), len);
            info!(link = %shared.id, len, "peer set send packet length");
        }
        Err(err) => warn!(link = %shared.id, error = %err, "ignoring packet length"),
    }
}

fn respond(shared: &LinkShared, frame: Frame) {
    if let Err(err) = shared.submit(vec![frame]) {
        debug!(link = %shared.id, error = %err, "response dropped");
    }
}

/// Echo firmware: write each queued packet back on its stream and release it.
///
/// Stops at the first packet that does not fit in the peer's buffer; the
/// next release from the peer resumes it.
fn pump_echo(shared: &LinkShared, entry: &StreamEntry) {
    while let Some(packet) = entry.front() {
        let aligned = align_up(packet.size());
        match entry.try_reserve_remote(aligned) {
            Ok(true) => {}
            Ok(false) | Err(_) => return,
        }
        if let Err(err) = shared.send_detached(entry.id(), packet.data.clone(), aligned) {
            debug!(link = %shared.id, stream = %entry.id(), error = %err, "echo stopped");
            entry.return_remote(aligned);
            return;
        }
        match entry.release_front() {
            Ok(released) => shared.after_release(entry, released),
            Err(_) => return,
        }
    }
}

/// `OpenStream` request frame.
pub(crate) fn open_frame(stream: u32, event_id: u32, name: &str, size: u32) -> Result<Frame> {
    let payload: Bytes = control::encode_open_stream(name, size)?;
    Ok(Frame::new(EventKind::OpenStream, stream, event_id, payload))
}
