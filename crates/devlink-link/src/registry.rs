//! Open streams of one link: capacity, fill accounting and inbound queues.
//!
//! The registry is an arena keyed by [`StreamId`] with a name index. Each
//! entry guards its queue and lifecycle with one mutex; the fill counters are
//! atomics written under that mutex so readers can snapshot them lock-free.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use devlink_frame::{align_up, UNASSIGNED_STREAM};
use devlink_sync::{RefSemaphore, SyncError};
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::types::{FillSide, Packet, PacketId, StreamId, StreamState};

#[derive(Debug)]
struct QueuedPacket {
    packet: Packet,
    delivered: bool,
}

#[derive(Debug)]
struct StreamInner {
    state: StreamState,
    peer_closed: bool,
    link_down: bool,
    queue: VecDeque<QueuedPacket>,
    next_packet_id: u32,
}

/// A packet removed from a stream queue by a release.
#[derive(Debug)]
pub(crate) struct Released {
    /// Aligned bytes returned to the local fill level.
    pub freed: usize,
    /// The stream is closing and this was its last packet.
    pub finalize: bool,
}

/// What [`StreamEntry::begin_close`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseStep {
    AlreadyClosing,
    /// Packets are still queued; the stream finalizes on the last release.
    Pending,
    Finalize,
}

#[derive(Debug)]
pub(crate) struct StreamEntry {
    id: StreamId,
    name: String,
    inner: Mutex<StreamInner>,
    capacity: AtomicUsize,
    local_fill: AtomicUsize,
    remote_fill: AtomicUsize,
    data_ready: RefSemaphore,
    space_ready: RefSemaphore,
}

impl StreamEntry {
    fn new(id: StreamId, name: &str, requested: u32) -> Result<Self> {
        Ok(Self {
            id,
            name: name.to_string(),
            inner: Mutex::new(StreamInner {
                state: StreamState::Open,
                peer_closed: false,
                link_down: false,
                queue: VecDeque::new(),
                next_packet_id: 0,
            }),
            capacity: AtomicUsize::new(align_up(requested as usize)),
            local_fill: AtomicUsize::new(0),
            remote_fill: AtomicUsize::new(0),
            data_ready: RefSemaphore::new(0)?,
            space_ready: RefSemaphore::new(0)?,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn fill(&self, side: FillSide) -> usize {
        match side {
            FillSide::Local => self.local_fill.load(Ordering::Acquire),
            FillSide::Remote => self.remote_fill.load(Ordering::Acquire),
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().state == StreamState::Open
    }

    /// Adopt a new capacity, never below what is already in use.
    fn set_capacity(&self, requested: u32) {
        let inner = self.lock();
        if inner.state == StreamState::Open {
            let capacity = align_up(requested as usize)
                .max(self.local_fill.load(Ordering::Acquire))
                .max(self.remote_fill.load(Ordering::Acquire));
            self.capacity.store(capacity, Ordering::Release);
        }
    }

    /// Queue an inbound packet.
    ///
    /// Fails with `ResourceExhausted` when it does not fit in the remaining
    /// capacity and with `StreamClosed` unless the stream is open.
    pub fn deliver(&self, data: Bytes) -> Result<PacketId> {
        let aligned = align_up(data.len());
        let mut inner = self.lock();
        if inner.state != StreamState::Open {
            return Err(LinkError::StreamClosed(self.id));
        }
        let fill = self.local_fill.load(Ordering::Acquire);
        let capacity = self.capacity();
        if fill + aligned > capacity {
            return Err(LinkError::ResourceExhausted(format!(
                "stream {} has {} of {capacity} bytes free, packet needs {aligned}",
                self.id,
                capacity.saturating_sub(fill),
            )));
        }
        let id = PacketId(inner.next_packet_id);
        inner.next_packet_id = inner.next_packet_id.wrapping_add(1);
        inner.queue.push_back(QueuedPacket {
            packet: Packet {
                stream_id: self.id,
                id,
                data,
            },
            delivered: false,
        });
        self.local_fill.store(fill + aligned, Ordering::Release);
        drop(inner);
        self.data_ready.post()?;
        Ok(id)
    }

    /// Hand out the oldest packet not yet read, blocking until one arrives.
    ///
    /// The packet stays queued (and counted) until it is released.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Packet> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t).map(|at| (at, t)));
        // A successful wait already claimed the arrival signal of one packet.
        let mut claimed = false;
        loop {
            {
                let mut inner = self.lock();
                if let Some(slot) = inner.queue.iter_mut().find(|slot| !slot.delivered) {
                    slot.delivered = true;
                    let packet = slot.packet.clone();
                    drop(inner);
                    if !claimed {
                        let _ = self.data_ready.try_wait();
                    }
                    return Ok(packet);
                }
                if inner.state != StreamState::Open || inner.peer_closed {
                    return Err(self.closed_error(&inner));
                }
            }

            let waited = match deadline {
                None => self.data_ready.wait(),
                Some((at, timeout)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(LinkError::Timeout(timeout));
                    }
                    self.data_ready.wait_timeout(at - now)
                }
            };
            match waited {
                Ok(()) => claimed = true,
                Err(SyncError::Cancelled) | Err(SyncError::InvalidState(_)) => {}
                Err(SyncError::Timeout(_)) => {
                    return Err(LinkError::Timeout(timeout.unwrap_or_default()))
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// The oldest queued packet, read or not.
    pub fn front(&self) -> Option<Packet> {
        self.lock().queue.front().map(|slot| slot.packet.clone())
    }

    /// Release the oldest queued packet.
    pub fn release_front(&self) -> Result<Released> {
        let mut inner = self.lock();
        let slot = inner.queue.pop_front().ok_or_else(|| {
            LinkError::InvalidState(format!("stream {} has no packet to release", self.id))
        })?;
        Ok(self.account_release(inner, slot))
    }

    /// Release exactly the packet `id`, wherever it sits in the queue.
    pub fn release_id(&self, id: PacketId) -> Result<Released> {
        let mut inner = self.lock();
        let pos = inner
            .queue
            .iter()
            .position(|slot| slot.packet.id == id)
            .ok_or_else(|| {
                LinkError::NotFound(format!("packet {id} is not queued on stream {}", self.id))
            })?;
        let slot = inner
            .queue
            .remove(pos)
            .ok_or_else(|| LinkError::NotFound(format!("packet {id}")))?;
        Ok(self.account_release(inner, slot))
    }

    fn account_release(&self, inner: MutexGuard<'_, StreamInner>, slot: QueuedPacket) -> Released {
        let freed = align_up(slot.packet.size());
        let fill = self.local_fill.load(Ordering::Acquire);
        self.local_fill
            .store(fill.saturating_sub(freed), Ordering::Release);
        let finalize = inner.state == StreamState::Closing && inner.queue.is_empty();
        drop(inner);
        if !slot.delivered {
            // Its arrival signal will never be claimed by a reader.
            let _ = self.data_ready.try_wait();
        }
        Released {
            freed,
            finalize,
        }
    }

    /// Reserve `aligned` bytes of peer buffer space, blocking while full.
    pub fn reserve_remote(&self, aligned: usize, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t).map(|at| (at, t)));
        loop {
            if self.try_reserve_remote(aligned)? {
                return Ok(());
            }
            let waited = match deadline {
                None => self.space_ready.wait(),
                Some((at, timeout)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(LinkError::Timeout(timeout));
                    }
                    self.space_ready.wait_timeout(at - now)
                }
            };
            match waited {
                Ok(()) | Err(SyncError::Cancelled) | Err(SyncError::InvalidState(_)) => {}
                Err(SyncError::Timeout(_)) => {
                    return Err(LinkError::Timeout(timeout.unwrap_or_default()))
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Non-blocking reservation. `Ok(false)` means not enough space yet.
    pub fn try_reserve_remote(&self, aligned: usize) -> Result<bool> {
        let inner = self.lock();
        if inner.state != StreamState::Open || inner.peer_closed {
            return Err(self.closed_error(&inner));
        }
        let fill = self.remote_fill.load(Ordering::Acquire);
        let capacity = self.capacity();
        if fill + aligned > capacity {
            return Ok(false);
        }
        self.remote_fill.store(fill + aligned, Ordering::Release);
        drop(inner);
        // Pass leftover space on; a writer that has not started waiting yet
        // still needs the signal, and a spare one only costs a re-check.
        if fill + aligned < capacity {
            let _ = self.space_ready.post();
        }
        Ok(true)
    }

    /// Return `bytes` of peer buffer space: the peer released them, or a
    /// reserved write was never delivered.
    pub fn return_remote(&self, bytes: usize) {
        let inner = self.lock();
        let fill = self.remote_fill.load(Ordering::Acquire);
        self.remote_fill
            .store(fill.saturating_sub(bytes), Ordering::Release);
        drop(inner);
        let _ = self.space_ready.post();
    }

    /// The peer closed its end; pending reads drain, writes fail.
    pub fn mark_peer_closed(&self) {
        self.lock().peer_closed = true;
        let _ = self.data_ready.post();
        let _ = self.space_ready.post();
    }

    pub fn begin_close(&self) -> CloseStep {
        let mut inner = self.lock();
        if inner.state != StreamState::Open {
            return CloseStep::AlreadyClosing;
        }
        inner.state = StreamState::Closing;
        let step = if inner.queue.is_empty() {
            CloseStep::Finalize
        } else {
            CloseStep::Pending
        };
        drop(inner);
        let _ = self.data_ready.post();
        let _ = self.space_ready.post();
        step
    }

    /// Mark the stream closed and tear down its primitives. Blocks until no
    /// thread is waiting on them.
    pub fn finalize(&self) {
        {
            let mut inner = self.lock();
            inner.state = StreamState::Closed;
        }
        self.shutdown_primitives();
        debug!(stream = %self.id, name = %self.name, "stream finalized");
    }

    /// The link went away: drop every packet and wake all waiters with `LinkDown`.
    pub fn fail_link(&self) {
        {
            let mut inner = self.lock();
            inner.state = StreamState::Closed;
            inner.link_down = true;
            inner.queue.clear();
            self.local_fill.store(0, Ordering::Release);
            self.remote_fill.store(0, Ordering::Release);
        }
        self.shutdown_primitives();
    }

    fn shutdown_primitives(&self) {
        for sem in [&self.data_ready, &self.space_ready] {
            let _ = sem.cancel_waiters();
            if let Err(err) = sem.destroy() {
                debug!(stream = %self.id, error = %err, "stream primitive already destroyed");
            }
        }
    }

    fn closed_error(&self, inner: &StreamInner) -> LinkError {
        if inner.link_down {
            LinkError::LinkDown
        } else {
            LinkError::StreamClosed(self.id)
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    streams: HashMap<StreamId, Arc<StreamEntry>>,
    names: HashMap<String, StreamId>,
    next_id: u32,
}

/// Arena of the streams open on one link.
#[derive(Debug)]
pub(crate) struct StreamRegistry {
    inner: Mutex<RegistryInner>,
    max_streams: usize,
}

impl StreamRegistry {
    pub fn new(max_streams: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_streams,
        }
    }

    pub fn get(&self, id: StreamId) -> Result<Arc<StreamEntry>> {
        self.lock()
            .streams
            .get(&id)
            .cloned()
            .ok_or_else(|| LinkError::NotFound(format!("stream {id}")))
    }

    pub fn find(&self, id: StreamId) -> Option<Arc<StreamEntry>> {
        self.lock().streams.get(&id).cloned()
    }

    /// Open `name`, allocating a fresh id if it does not exist yet.
    ///
    /// With `resize`, an existing stream takes the requested capacity. Returns
    /// the entry and whether it was created by this call.
    pub fn open_allocated(
        &self,
        name: &str,
        requested: u32,
        resize: bool,
    ) -> Result<(Arc<StreamEntry>, bool)> {
        let mut inner = self.lock();
        if let Some(entry) = Self::existing(&inner, name)? {
            if resize {
                entry.set_capacity(requested);
            }
            return Ok((entry, false));
        }
        self.check_slot(&inner)?;

        let mut id = inner.next_id;
        while id == UNASSIGNED_STREAM || inner.streams.contains_key(&StreamId(id)) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        let entry = Arc::new(StreamEntry::new(StreamId(id), name, requested)?);
        Self::insert(&mut inner, &entry);
        Ok((entry, true))
    }

    /// Open `name` under an id chosen by the peer.
    pub fn open_assigned(
        &self,
        id: StreamId,
        name: &str,
        requested: u32,
        resize: bool,
    ) -> Result<(Arc<StreamEntry>, bool)> {
        let mut inner = self.lock();
        if let Some(entry) = Self::existing(&inner, name)? {
            if entry.id() != id {
                return Err(LinkError::InvalidState(format!(
                    "stream {name} is open as {} but the peer assigned {id}",
                    entry.id()
                )));
            }
            if resize {
                entry.set_capacity(requested);
            }
            return Ok((entry, false));
        }
        if inner.streams.contains_key(&id) {
            return Err(LinkError::InvalidState(format!(
                "stream id {id} is already in use"
            )));
        }
        self.check_slot(&inner)?;

        let entry = Arc::new(StreamEntry::new(id, name, requested)?);
        Self::insert(&mut inner, &entry);
        Ok((entry, true))
    }

    fn existing(inner: &RegistryInner, name: &str) -> Result<Option<Arc<StreamEntry>>> {
        let Some(entry) = inner
            .names
            .get(name)
            .and_then(|id| inner.streams.get(id))
            .cloned()
        else {
            return Ok(None);
        };
        if !entry.is_open() {
            return Err(LinkError::InvalidState(format!(
                "stream {name} is closing"
            )));
        }
        Ok(Some(entry))
    }

    fn check_slot(&self, inner: &RegistryInner) -> Result<()> {
        if inner.streams.len() >= self.max_streams {
            return Err(LinkError::ResourceExhausted(format!(
                "all {} stream slots are in use",
                self.max_streams
            )));
        }
        Ok(())
    }

    fn insert(inner: &mut RegistryInner, entry: &Arc<StreamEntry>) {
        inner.names.insert(entry.name().to_string(), entry.id());
        inner.streams.insert(entry.id(), Arc::clone(entry));
    }

    /// Drop the entry from the arena, freeing its slot.
    pub fn remove(&self, id: StreamId) -> Option<Arc<StreamEntry>> {
        let mut inner = self.lock();
        let entry = inner.streams.remove(&id)?;
        if inner.names.get(entry.name()) == Some(&id) {
            inner.names.remove(entry.name());
        }
        Some(entry)
    }

    /// Empty the arena, returning every entry.
    pub fn drain(&self) -> Vec<Arc<StreamEntry>> {
        let mut inner = self.lock();
        inner.names.clear();
        inner.streams.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.lock().streams.keys().copied().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::error::ErrorKind;

    fn stream(size: u32) -> Arc<StreamEntry> {
        StreamRegistry::new(4)
            .open_allocated("s", size, false)
            .unwrap()
            .0
    }

    #[test]
    fn capacity_rounds_up_to_alignment() {
        assert_eq!(stream(100).capacity(), 128);
        assert_eq!(stream(1000).capacity(), 1024);
    }

    #[test]
    fn delivery_accounts_aligned_size() {
        let s = stream(1000);
        let id = s.deliver(Bytes::from(vec![1u8; 600])).unwrap();
        assert_eq!(id, PacketId(0));
        assert_eq!(s.fill(FillSide::Local), 640);

        let released = s.release_front().unwrap();
        assert_eq!(released.freed, 640);
        assert_eq!(s.fill(FillSide::Local), 0);
    }

    #[test]
    fn over_capacity_delivery_rejected() {
        let s = stream(128);
        s.deliver(Bytes::from(vec![0u8; 100])).unwrap();
        let err = s.deliver(Bytes::from(vec![0u8; 1])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(s.fill(FillSide::Local), 128);
    }

    #[test]
    fn reads_follow_arrival_order_and_do_not_dequeue() {
        let s = stream(1024);
        for byte in 0..3u8 {
            s.deliver(Bytes::from(vec![byte; 8])).unwrap();
        }
        for expected in 0..3u32 {
            let packet = s.read(Some(Duration::from_millis(10))).unwrap();
            assert_eq!(packet.id, PacketId(expected));
        }
        assert_eq!(s.fill(FillSide::Local), 192);
        assert!(s.read(Some(Duration::from_millis(10))).is_err());
    }

    #[test]
    fn release_by_id_leaves_others_queued() {
        let s = stream(1024);
        for _ in 0..3 {
            s.deliver(Bytes::from_static(b"x")).unwrap();
        }
        s.release_id(PacketId(1)).unwrap();
        assert_eq!(s.front().unwrap().id, PacketId(0));
        assert_eq!(s.fill(FillSide::Local), 128);
        assert_eq!(
            s.release_id(PacketId(1)).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn release_on_empty_queue_is_invalid_state() {
        let s = stream(64);
        assert_eq!(
            s.release_front().unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn read_timeout_leaves_queue_untouched() {
        let s = stream(64);
        let start = Instant::now();
        let err = s.read(Some(Duration::from_millis(50))).unwrap_err();
        let elapsed = start.elapsed();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(200));
        assert!(s.front().is_none());
    }

    #[test]
    fn blocked_reader_wakes_on_delivery() {
        let s = stream(1024);
        let reader = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.read(None))
        };
        thread::sleep(Duration::from_millis(20));
        s.deliver(Bytes::from_static(b"wake")).unwrap();
        assert_eq!(reader.join().unwrap().unwrap().data.as_ref(), b"wake");
    }

    #[test]
    fn remote_reservation_blocks_until_returned() {
        let s = stream(128);
        assert!(s.try_reserve_remote(128).unwrap());
        assert!(!s.try_reserve_remote(64).unwrap());

        let err = s
            .reserve_remote(64, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(s.fill(FillSide::Remote), 128);

        let writer = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.reserve_remote(64, None))
        };
        thread::sleep(Duration::from_millis(20));
        s.return_remote(128);
        writer.join().unwrap().unwrap();
        assert_eq!(s.fill(FillSide::Remote), 64);
    }

    #[test]
    fn close_with_queued_packets_waits_for_release() {
        let s = stream(256);
        s.deliver(Bytes::from_static(b"late")).unwrap();
        assert_eq!(s.begin_close(), CloseStep::Pending);
        assert_eq!(s.begin_close(), CloseStep::AlreadyClosing);

        // Unread data is still handed out while closing.
        assert_eq!(s.read(None).unwrap().data.as_ref(), b"late");
        assert_eq!(s.read(None).unwrap_err().kind(), ErrorKind::StreamClosed);
        assert!(s.release_front().unwrap().finalize);
    }

    #[test]
    fn link_failure_wakes_blocked_reader_with_link_down() {
        let s = stream(64);
        let reader = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.read(None))
        };
        thread::sleep(Duration::from_millis(20));
        s.fail_link();
        assert_eq!(
            reader.join().unwrap().unwrap_err().kind(),
            ErrorKind::LinkDown
        );
        assert!(!s.is_open());
    }

    #[test]
    fn concurrent_readers_each_get_a_packet() {
        for _ in 0..50 {
            let s = stream(1024);
            let readers: Vec<_> = (0..2)
                .map(|_| {
                    let s = Arc::clone(&s);
                    thread::spawn(move || s.read(Some(Duration::from_millis(500))))
                })
                .collect();
            thread::sleep(Duration::from_millis(10));
            s.deliver(Bytes::from_static(b"a")).unwrap();
            s.deliver(Bytes::from_static(b"b")).unwrap();

            let mut ids: Vec<_> = readers
                .into_iter()
                .map(|r| r.join().unwrap().unwrap().id)
                .collect();
            ids.sort();
            assert_eq!(ids, vec![PacketId(0), PacketId(1)]);
        }
    }

    #[test]
    fn reservation_with_leftover_space_leaves_a_signal() {
        let s = stream(128);
        assert!(s.try_reserve_remote(128).unwrap());

        let first = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.reserve_remote(64, None))
        };
        thread::sleep(Duration::from_millis(20));
        s.return_remote(128);
        first.join().unwrap().unwrap();

        // A second writer that failed its check before the space came back,
        // and has not started waiting yet, must still find a signal.
        assert_eq!(s.space_ready.get_ref_count(), 0);
        assert!(s.space_ready.try_wait().unwrap());
        assert!(s.try_reserve_remote(64).unwrap());
        assert_eq!(s.fill(FillSide::Remote), 128);
    }

    #[test]
    fn registry_limits_slots_and_reuses_names() {
        let reg = StreamRegistry::new(2);
        let (a, created) = reg.open_allocated("a", 64, false).unwrap();
        assert!(created);
        let (again, created) = reg.open_allocated("a", 256, true).unwrap();
        assert!(!created);
        assert_eq!(again.id(), a.id());
        assert_eq!(again.capacity(), 256);

        reg.open_allocated("b", 64, false).unwrap();
        let err = reg.open_allocated("c", 64, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        reg.remove(a.id()).unwrap();
        reg.open_allocated("c", 64, false).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn assigned_ids_must_agree_with_names() {
        let reg = StreamRegistry::new(4);
        reg.open_assigned(StreamId(7), "x", 64, false).unwrap();
        assert!(reg.open_assigned(StreamId(7), "x", 64, false).is_ok());
        assert_eq!(
            reg.open_assigned(StreamId(8), "x", 64, false)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            reg.open_assigned(StreamId(7), "y", 64, false)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidState
        );
    }
}
