//! In-process duplex pipe standing in for a physical bus.
//!
//! Each direction is a bounded byte queue. Writers block while the queue is
//! full, readers block while it is empty, and dropping the last handle of one
//! end (or calling `shutdown`) closes both directions.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::traits::LinkStream;

/// Bytes buffered per direction before writers block.
pub const PIPE_CAPACITY: usize = 1024 * 1024;

/// Create two connected [`LinkStream`]s.
pub fn pipe_pair() -> (LinkStream, LinkStream) {
    let a_to_b = Arc::new(Channel::default());
    let b_to_a = Arc::new(Channel::default());

    let a = EmulatedEnd::new(Arc::clone(&b_to_a), Arc::clone(&a_to_b));
    let b = EmulatedEnd::new(a_to_b, b_to_a);
    (LinkStream::from_emulated(a), LinkStream::from_emulated(b))
}

#[derive(Default)]
struct Channel {
    state: Mutex<ChannelState>,
    readable: Condvar,
    writable: Condvar,
}

#[derive(Default)]
struct ChannelState {
    buf: VecDeque<u8>,
    closed: bool,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

struct EndShared {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
}

impl Drop for EndShared {
    fn drop(&mut self) {
        self.tx.close();
        self.rx.close();
    }
}

/// One end of an emulated pipe. Clones share the same connection.
#[derive(Clone)]
pub(crate) struct EmulatedEnd {
    shared: Arc<EndShared>,
}

impl EmulatedEnd {
    fn new(rx: Arc<Channel>, tx: Arc<Channel>) -> Self {
        Self {
            shared: Arc::new(EndShared {
                rx,
                tx,
                read_timeout: Mutex::new(None),
                write_timeout: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self
            .shared
            .read_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self
            .shared
            .write_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub(crate) fn shutdown(&self) {
        self.shared.tx.close();
        self.shared.rx.close();
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = deadline_from(&self.shared.read_timeout);
        let channel = &self.shared.rx;
        let mut state = channel.lock();
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                channel.writable.notify_all();
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            state = park(&channel.readable, state, deadline)?;
        }
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = deadline_from(&self.shared.write_timeout);
        let channel = &self.shared.tx;
        let mut state = channel.lock();
        loop {
            if state.closed {
                return Err(io::Error::from(ErrorKind::BrokenPipe));
            }
            let space = PIPE_CAPACITY - state.buf.len();
            if space > 0 {
                let n = space.min(buf.len());
                state.buf.extend(&buf[..n]);
                channel.readable.notify_all();
                return Ok(n);
            }
            state = park(&channel.writable, state, deadline)?;
        }
    }
}

fn deadline_from(timeout: &Mutex<Option<Duration>>) -> Option<Instant> {
    timeout
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .and_then(|timeout| Instant::now().checked_add(timeout))
}

fn park<'a>(
    cond: &Condvar,
    state: MutexGuard<'a, ChannelState>,
    deadline: Option<Instant>,
) -> io::Result<MutexGuard<'a, ChannelState>> {
    match deadline {
        None => Ok(cond.wait(state).unwrap_or_else(PoisonError::into_inner)),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            Ok(cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use super::*;

    #[test]
    fn bytes_cross_in_order() {
        let (mut left, mut right) = pipe_pair();
        left.write_all(b"hello ").unwrap();
        left.write_all(b"device").unwrap();

        let mut buf = [0u8; 12];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello device");
    }

    #[test]
    fn duplex_directions_are_independent() {
        let (mut left, mut right) = pipe_pair();
        right.write_all(b"pong").unwrap();
        left.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        left.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn read_timeout_reports_would_block() {
        let (left, _right) = pipe_pair();
        left.set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut reader = left;
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn shutdown_unblocks_reader_of_clone() {
        let (left, _right) = pipe_pair();
        let mut reader = left.try_clone().unwrap();
        let handle = thread::spawn(move || reader.read(&mut [0u8; 8]));

        thread::sleep(Duration::from_millis(20));
        left.shutdown().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn dropping_peer_signals_eof_and_broken_pipe() {
        let (mut left, right) = pipe_pair();
        drop(right);

        assert_eq!(left.read(&mut [0u8; 8]).unwrap(), 0);
        let err = left.write(b"late").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn writer_blocks_until_reader_drains() {
        let (mut left, mut right) = pipe_pair();
        let payload = vec![0x5Au8; PIPE_CAPACITY + 4096];
        let expected = payload.len();

        let writer = thread::spawn(move || {
            left.write_all(&payload).unwrap();
            left
        });

        let mut received = vec![0u8; expected];
        right.read_exact(&mut received).unwrap();
        assert!(received.iter().all(|b| *b == 0x5A));
        let _left = writer.join().unwrap();
    }
}
