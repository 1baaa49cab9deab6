//! Bounded multi-reader / multi-writer FIFO channel.
//!
//! All bookkeeping (buffer, reader and writer sets, waiter queues) lives
//! under one mutex that is never held across an `.await`. Suspended readers
//! and writers park a oneshot slot in a FIFO queue and are woken in arrival
//! order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::ChannelError;
use crate::message::{Ip, Msg};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// What `shutdown` does with readers still attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Refuse new writes and let readers drain what is buffered.
    #[default]
    WaitForDrain,
    /// Drop buffered messages and close every endpoint right away.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Open,
    /// No writers left, buffered messages are still being read.
    Draining,
    /// No writers left and nothing buffered.
    Drained,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderMode {
    Live,
    /// Has observed `done`; keeps answering `done` until closed.
    Finished,
}

type ReadSlot = oneshot::Sender<Result<Msg, ChannelError>>;
type WriteSlot = oneshot::Sender<Result<(), ChannelError>>;

#[derive(Debug)]
struct BlockedRead {
    reader: u64,
    slot: ReadSlot,
}

#[derive(Debug)]
struct BlockedWrite {
    writer: Option<u64>,
    ip: Ip,
    /// `None` for a packet handed back by a cancelled read while the buffer was full.
    slot: Option<WriteSlot>,
}

#[derive(Debug)]
struct Inner {
    buffer: VecDeque<Ip>,
    capacity: usize,
    used: bool,
    readers: HashMap<u64, ReaderMode>,
    writers: HashSet<u64>,
    blocked_readers: VecDeque<BlockedRead>,
    blocked_writers: VecDeque<BlockedWrite>,
    draining: bool,
    writes_open: bool,
    shut_down: bool,
    next_handle: u64,
}

impl Inner {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            used: false,
            readers: HashMap::new(),
            writers: HashSet::new(),
            blocked_readers: VecDeque::new(),
            blocked_writers: VecDeque::new(),
            draining: false,
            writes_open: true,
            shut_down: false,
            next_handle: 1,
        }
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    /// Gives `ip` to the longest-waiting reader, or returns it if nobody takes it.
    fn hand_to_reader(&mut self, mut ip: Ip) -> Result<(), Ip> {
        while let Some(blocked) = self.blocked_readers.pop_front() {
            match blocked.slot.send(Ok(Msg::Value(ip))) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    let Ok(Msg::Value(back)) = returned else {
                        return Ok(());
                    };
                    ip = back;
                }
            }
        }
        Err(ip)
    }

    /// Moves parked writes into freed buffer space, oldest first.
    fn admit_blocked_writes(&mut self) {
        while self.buffer.len() < self.capacity {
            let Some(blocked) = self.blocked_writers.pop_front() else {
                break;
            };
            match blocked.slot {
                Some(slot) if slot.is_closed() => {
                    trace!(writer = ?blocked.writer, "dropping write of a cancelled writer");
                }
                Some(slot) => {
                    self.buffer.push_back(blocked.ip);
                    let _ = slot.send(Ok(()));
                }
                None => self.buffer.push_back(blocked.ip),
            }
        }
    }

    fn begin_drain(&mut self) {
        self.draining = true;
        // Readers only block on an empty buffer, so every one of them is done.
        while let Some(blocked) = self.blocked_readers.pop_front() {
            // a cancelled read never observes this done
            if blocked.slot.is_closed() {
                continue;
            }
            self.readers.insert(blocked.reader, ReaderMode::Finished);
            let _ = blocked.slot.send(Ok(Msg::Done));
        }
    }

    fn remove_writer(&mut self, writer: u64) -> bool {
        if !self.writers.remove(&writer) {
            return false;
        }
        if self.writers.is_empty() {
            self.begin_drain();
        }
        true
    }

    /// Puts a packet taken by a cancelled read back at the head of the queue.
    fn requeue(&mut self, ip: Ip) {
        if self.shut_down {
            return;
        }
        let ip = match self.hand_to_reader(ip) {
            Ok(()) => return,
            Err(ip) => ip,
        };
        self.buffer.push_front(ip);
        if self.buffer.len() > self.capacity {
            if let Some(last) = self.buffer.pop_back() {
                self.blocked_writers.push_front(BlockedWrite {
                    writer: None,
                    ip: last,
                    slot: None,
                });
            }
        }
    }
}

/// A bounded FIFO queue shared by any number of readers and writers.
///
/// Cloning gives another view onto the same channel.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u64,
    close_policy: ClosePolicy,
    inner: Arc<Mutex<Inner>>,
}

impl Channel {
    /// Creates a channel holding at most `capacity` messages.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, ClosePolicy::default())
    }

    pub fn with_policy(capacity: usize, close_policy: ClosePolicy) -> Self {
        assert!(capacity >= 1, "channel capacity must be at least 1");
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            close_policy,
            inner: Arc::new(Mutex::new(Inner::new(capacity))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn close_policy(&self) -> ClosePolicy {
        self.close_policy
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Changes the capacity; only allowed before anything was read or written.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ChannelError> {
        assert!(capacity >= 1, "channel capacity must be at least 1");
        let mut inner = self.lock();
        if inner.used || inner.shut_down {
            return Err(ChannelError::InUse);
        }
        inner.capacity = capacity;
        Ok(())
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Readers that have not yet seen `done`.
    pub fn reader_count(&self) -> usize {
        self.lock()
            .readers
            .values()
            .filter(|m| **m == ReaderMode::Live)
            .count()
    }

    pub fn writer_count(&self) -> usize {
        self.lock().writers.len()
    }

    pub fn state(&self) -> ChannelState {
        let inner = self.lock();
        if inner.shut_down {
            ChannelState::Closed
        } else if inner.draining
            && inner.buffer.is_empty()
            && inner.blocked_writers.is_empty()
        {
            ChannelState::Drained
        } else if inner.draining {
            ChannelState::Draining
        } else {
            ChannelState::Open
        }
    }

    pub fn is_drained(&self) -> bool {
        self.state() == ChannelState::Drained
    }

    pub fn create_reader(&self) -> Result<ReaderHandle, ChannelError> {
        let mut inner = self.lock();
        if inner.shut_down {
            return Err(ChannelError::ChannelClosed);
        }
        let id = inner.next_handle();
        inner.readers.insert(id, ReaderMode::Live);
        debug!(channel = self.id, reader = id, "reader created");
        Ok(ReaderHandle {
            id,
            channel: self.clone(),
        })
    }

    /// Registers a writer. A writer added while draining re-arms the channel.
    pub fn create_writer(&self) -> Result<WriterHandle, ChannelError> {
        let mut inner = self.lock();
        if inner.shut_down || !inner.writes_open {
            return Err(ChannelError::ChannelClosed);
        }
        let id = inner.next_handle();
        inner.writers.insert(id);
        inner.draining = false;
        debug!(channel = self.id, writer = id, "writer created");
        Ok(WriterHandle {
            id,
            channel: self.clone(),
        })
    }

    async fn read(&self, reader: u64) -> Result<Msg, ChannelError> {
        let rx = {
            let mut inner = self.lock();
            if inner.shut_down {
                return Err(ChannelError::ChannelClosed);
            }
            match inner.readers.get(&reader) {
                None => return Err(ChannelError::HandleClosed),
                Some(ReaderMode::Finished) => return Ok(Msg::Done),
                Some(ReaderMode::Live) => {}
            }
            inner.used = true;
            if let Some(ip) = inner.buffer.pop_front() {
                inner.admit_blocked_writes();
                return Ok(Msg::Value(ip));
            }
            if inner.draining {
                inner.readers.insert(reader, ReaderMode::Finished);
                return Ok(Msg::Done);
            }
            let (slot, rx) = oneshot::channel();
            inner.blocked_readers.push_back(BlockedRead { reader, slot });
            rx
        };

        let mut pending = PendingRead {
            channel: self,
            rx,
            armed: true,
        };
        let outcome = (&mut pending.rx).await;
        pending.armed = false;
        outcome.unwrap_or(Err(ChannelError::ChannelClosed))
    }

    async fn write(&self, writer: u64, msg: Msg) -> Result<(), ChannelError> {
        let rx = {
            let mut inner = self.lock();
            if inner.shut_down {
                return Err(ChannelError::ChannelClosed);
            }
            if !inner.writers.contains(&writer) {
                return Err(ChannelError::HandleClosed);
            }
            let ip = match msg {
                Msg::Done => {
                    inner.remove_writer(writer);
                    debug!(channel = self.id, writer, "writer sent done");
                    return Ok(());
                }
                Msg::Value(ip) => ip,
            };
            if !inner.writes_open {
                return Err(ChannelError::ChannelClosed);
            }
            inner.used = true;
            let ip = match inner.hand_to_reader(ip) {
                Ok(()) => return Ok(()),
                Err(ip) => ip,
            };
            if inner.buffer.len() < inner.capacity {
                inner.buffer.push_back(ip);
                return Ok(());
            }
            let (slot, rx) = oneshot::channel();
            inner.blocked_writers.push_back(BlockedWrite {
                writer: Some(writer),
                ip,
                slot: Some(slot),
            });
            rx
        };
        rx.await.unwrap_or(Err(ChannelError::ChannelClosed))
    }

    fn close_reader(&self, reader: u64) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        if inner.readers.remove(&reader).is_none() {
            return Err(ChannelError::HandleClosed);
        }
        let (mine, others): (VecDeque<_>, VecDeque<_>) = inner
            .blocked_readers
            .drain(..)
            .partition(|b| b.reader == reader);
        inner.blocked_readers = others;
        for blocked in mine {
            let _ = blocked.slot.send(Err(ChannelError::HandleClosed));
        }
        debug!(channel = self.id, reader, "reader closed");
        Ok(())
    }

    fn close_writer(&self, writer: u64) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        if !inner.writers.contains(&writer) {
            return Err(ChannelError::HandleClosed);
        }
        let (mine, others): (VecDeque<_>, VecDeque<_>) = inner
            .blocked_writers
            .drain(..)
            .partition(|b| b.writer == Some(writer));
        inner.blocked_writers = others;
        for blocked in mine {
            if let Some(slot) = blocked.slot {
                let _ = slot.send(Err(ChannelError::HandleClosed));
            }
        }
        inner.remove_writer(writer);
        debug!(channel = self.id, writer, "writer closed");
        Ok(())
    }

    /// Closes the channel for everybody.
    ///
    /// With `wait_for_drain` new writes are refused, suspended writers fail
    /// and readers drain what is left. Without it every endpoint is closed
    /// at once and buffered messages are discarded; the count of discarded
    /// messages is returned.
    pub fn close_all(&self, wait_for_drain: bool) -> usize {
        let mut inner = self.lock();
        if inner.shut_down {
            return 0;
        }
        if wait_for_drain {
            inner.writes_open = false;
            let blocked = std::mem::take(&mut inner.blocked_writers);
            for write in blocked {
                match write.slot {
                    Some(slot) => {
                        let _ = slot.send(Err(ChannelError::ChannelClosed));
                    }
                    None => inner.blocked_writers.push_back(write),
                }
            }
            inner.begin_drain();
            debug!(channel = self.id, buffered = inner.buffer.len(), "channel draining");
            return 0;
        }

        inner.shut_down = true;
        let discarded = inner.buffer.len() + inner.blocked_writers.len();
        inner.buffer.clear();
        for blocked in inner.blocked_readers.drain(..) {
            let _ = blocked.slot.send(Err(ChannelError::ChannelClosed));
        }
        for write in inner.blocked_writers.drain(..) {
            if let Some(slot) = write.slot {
                let _ = slot.send(Err(ChannelError::ChannelClosed));
            }
        }
        inner.readers.clear();
        inner.writers.clear();
        debug!(channel = self.id, discarded, "channel closed");
        discarded
    }

    /// Closes according to the channel's close policy.
    pub fn shutdown(&self) -> usize {
        self.close_all(self.close_policy == ClosePolicy::WaitForDrain)
    }

    fn requeue(&self, ip: Ip) {
        self.lock().requeue(ip);
    }
}

/// Returns an already delivered packet to the channel if the read is dropped.
struct PendingRead<'a> {
    channel: &'a Channel,
    rx: oneshot::Receiver<Result<Msg, ChannelError>>,
    armed: bool,
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.rx.close();
        if let Ok(Ok(Msg::Value(ip))) = self.rx.try_recv() {
            trace!(channel = self.channel.id, "read cancelled, requeueing packet");
            self.channel.requeue(ip);
        }
    }
}

/// Read endpoint of a [`Channel`].
#[derive(Debug, Clone)]
pub struct ReaderHandle {
    id: u64,
    channel: Channel,
}

impl ReaderHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Next message, waiting while the buffer is empty and writers remain.
    pub async fn read(&self) -> Result<Msg, ChannelError> {
        self.channel.read(self.id).await
    }

    /// Deregisters the reader. Never blocks.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.channel.close_reader(self.id)
    }
}

/// Write endpoint of a [`Channel`].
#[derive(Debug, Clone)]
pub struct WriterHandle {
    id: u64,
    channel: Channel,
}

impl WriterHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Appends a value, waiting while the buffer is full. Writing `done`
    /// deregisters this writer.
    pub async fn write(&self, msg: Msg) -> Result<(), ChannelError> {
        self.channel.write(self.id, msg).await
    }

    /// Deregisters the writer like `done` would, without a message. Never blocks.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.channel.close_writer(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn value(msg: Msg) -> serde_json::Value {
        msg.into_ip().expect("expected a value").content
    }

    async fn blocked<F: std::future::Future>(fut: F) -> bool {
        timeout(Duration::from_millis(50), fut).await.is_err()
    }

    #[tokio::test]
    async fn reads_come_back_in_write_order() {
        let chan = Channel::new(8);
        let w = chan.create_writer().unwrap();
        let r = chan.create_reader().unwrap();
        for i in 0..5 {
            w.write(Msg::value(i)).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(value(r.read().await.unwrap()), i);
        }
    }

    #[tokio::test]
    async fn capacity_two_scenario() {
        let chan = Channel::new(2);
        let w = chan.create_writer().unwrap();
        let r = chan.create_reader().unwrap();

        w.write(Msg::value("A")).await.unwrap();
        w.write(Msg::value("B")).await.unwrap();
        assert_eq!(chan.len(), 2);

        let w2 = w.clone();
        let write_c = tokio::spawn(async move { w2.write(Msg::value("C")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!write_c.is_finished());
        assert_eq!(chan.len(), 2);

        assert_eq!(value(r.read().await.unwrap()), "A");
        write_c.await.unwrap().unwrap();
        assert_eq!(chan.len(), 2);
        assert_eq!(value(r.read().await.unwrap()), "B");
        assert_eq!(value(r.read().await.unwrap()), "C");
    }

    #[tokio::test]
    async fn read_blocks_on_empty_buffer() {
        let chan = Channel::new(1);
        let _w = chan.create_writer().unwrap();
        let r = chan.create_reader().unwrap();
        assert!(blocked(r.read()).await);
    }

    #[tokio::test]
    async fn done_drains_then_repeats() {
        let chan = Channel::new(4);
        let w = chan.create_writer().unwrap();
        let r = chan.create_reader().unwrap();
        w.write(Msg::value(1)).await.unwrap();
        w.write(Msg::Done).await.unwrap();
        assert_eq!(chan.state(), ChannelState::Draining);

        assert_eq!(value(r.read().await.unwrap()), 1);
        assert_eq!(r.read().await.unwrap(), Msg::Done);
        assert_eq!(r.read().await.unwrap(), Msg::Done);
        assert!(chan.is_drained());

        // a late reader drains too
        let late = chan.create_reader().unwrap();
        assert_eq!(late.read().await.unwrap(), Msg::Done);
    }

    #[tokio::test]
    async fn last_writer_wakes_all_blocked_readers() {
        let chan = Channel::new(1);
        let w1 = chan.create_writer().unwrap();
        let w2 = chan.create_writer().unwrap();
        let readers: Vec<_> = (0..3).map(|_| chan.create_reader().unwrap()).collect();
        let tasks: Vec<_> = readers
            .iter()
            .cloned()
            .map(|r| tokio::spawn(async move { r.read().await }))
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        w1.close().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tasks.iter().all(|t| !t.is_finished()));

        w2.write(Msg::Done).await.unwrap();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Msg::Done);
        }
        assert_eq!(chan.reader_count(), 0);
    }

    #[tokio::test]
    async fn writer_close_without_readers_is_drain_complete() {
        let chan = Channel::new(3);
        let w = chan.create_writer().unwrap();
        assert_eq!(chan.state(), ChannelState::Open);
        w.close().unwrap();
        assert_eq!(chan.state(), ChannelState::Drained);
        assert_eq!(chan.close_all(false), 0);
        assert_eq!(chan.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn competing_readers_split_the_stream() {
        let chan = Channel::new(1);
        let w = chan.create_writer().unwrap();
        let r1 = chan.create_reader().unwrap();
        let r2 = chan.create_reader().unwrap();

        let collect = |r: ReaderHandle| {
            tokio::spawn(async move {
                let mut got = Vec::new();
                loop {
                    match r.read().await.unwrap() {
                        Msg::Value(ip) => got.push(ip.content),
                        Msg::Done => break,
                    }
                    tokio::task::yield_now().await;
                }
                got
            })
        };
        let t1 = collect(r1);
        let t2 = collect(r2);

        for i in 0..3 {
            w.write(Msg::value(i)).await.unwrap();
        }
        w.write(Msg::Done).await.unwrap();

        let mut all = t1.await.unwrap();
        all.extend(t2.await.unwrap());
        all.sort_by_key(|v| v.as_i64());
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn closing_twice_reports_handle_closed() {
        let chan = Channel::new(1);
        let r = chan.create_reader().unwrap();
        let w = chan.create_writer().unwrap();
        assert_eq!(r.close(), Ok(()));
        assert_eq!(r.close(), Err(ChannelError::HandleClosed));
        assert_eq!(r.read().await, Err(ChannelError::HandleClosed));
        assert_eq!(w.close(), Ok(()));
        assert_eq!(w.close(), Err(ChannelError::HandleClosed));
        assert_eq!(
            w.write(Msg::value(1)).await,
            Err(ChannelError::HandleClosed)
        );
    }

    #[tokio::test]
    async fn writer_done_counts_as_close() {
        let chan = Channel::new(1);
        let w = chan.create_writer().unwrap();
        w.write(Msg::Done).await.unwrap();
        assert_eq!(w.close(), Err(ChannelError::HandleClosed));
    }

    #[tokio::test]
    async fn closing_a_reader_fails_its_pending_read_only() {
        let chan = Channel::new(1);
        let w = chan.create_writer().unwrap();
        let r1 = chan.create_reader().unwrap();
        let r2 = chan.create_reader().unwrap();
        let r1c = r1.clone();
        let pending = tokio::spawn(async move { r1c.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        r1.close().unwrap();
        assert_eq!(pending.await.unwrap(), Err(ChannelError::HandleClosed));

        w.write(Msg::value("x")).await.unwrap();
        assert_eq!(value(r2.read().await.unwrap()), "x");
        assert_eq!(chan.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn immediate_close_fails_blocked_writer() {
        let chan = Channel::new(1);
        let w = chan.create_writer().unwrap();
        let r = chan.create_reader().unwrap();
        w.write(Msg::value(1)).await.unwrap();
        let w2 = w.clone();
        let stuck = tokio::spawn(async move { w2.write(Msg::value(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(chan.close_all(false), 2);
        assert_eq!(stuck.await.unwrap(), Err(ChannelError::ChannelClosed));
        assert_eq!(r.read().await, Err(ChannelError::ChannelClosed));
        assert!(chan.create_reader().is_err());
    }

    #[tokio::test]
    async fn drain_close_keeps_buffer_for_readers() {
        let chan = Channel::new(1);
        let w = chan.create_writer().unwrap();
        let r = chan.create_reader().unwrap();
        w.write(Msg::value("kept")).await.unwrap();
        let w2 = w.clone();
        let stuck = tokio::spawn(async move { w2.write(Msg::value("refused")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        chan.close_all(true);
        assert_eq!(stuck.await.unwrap(), Err(ChannelError::ChannelClosed));
        assert_eq!(
            w.write(Msg::value("late")).await,
            Err(ChannelError::ChannelClosed)
        );
        assert_eq!(value(r.read().await.unwrap()), "kept");
        assert_eq!(r.read().await.unwrap(), Msg::Done);
    }

    #[tokio::test]
    async fn cancelled_read_loses_nothing() {
        let chan = Channel::new(1);
        let w = chan.create_writer().unwrap();
        let r1 = chan.create_reader().unwrap();
        let r2 = chan.create_reader().unwrap();

        // r1 parks, gets the packet handed over, and is dropped before polling again
        let mut fut = Box::pin(r1.read());
        assert!(futures::poll!(&mut fut).is_pending());
        w.write(Msg::value("once")).await.unwrap();
        drop(fut);

        assert_eq!(value(r2.read().await.unwrap()), "once");
    }

    #[tokio::test]
    async fn blocked_writers_are_admitted_in_arrival_order() {
        let chan = Channel::new(1);
        let r = chan.create_reader().unwrap();
        let w = chan.create_writer().unwrap();
        w.write(Msg::value(0)).await.unwrap();

        let mut tasks = Vec::new();
        for i in 1..=5 {
            let wi = chan.create_writer().unwrap();
            tasks.push(tokio::spawn(async move { wi.write(Msg::value(i)).await }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for i in 0..=5 {
            assert_eq!(value(r.read().await.unwrap()), i);
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn capacity_is_fixed_after_first_use() {
        let chan = Channel::new(1);
        chan.set_capacity(3).unwrap();
        assert_eq!(chan.capacity(), 3);
        let w = chan.create_writer().unwrap();
        w.write(Msg::value(1)).await.unwrap();
        assert_eq!(chan.set_capacity(5), Err(ChannelError::InUse));
    }

    #[tokio::test]
    async fn new_writer_rearms_a_drained_channel() {
        let chan = Channel::new(1);
        let first = chan.create_writer().unwrap();
        let finished = chan.create_reader().unwrap();
        first.close().unwrap();
        assert_eq!(finished.read().await.unwrap(), Msg::Done);

        let second = chan.create_writer().unwrap();
        let fresh = chan.create_reader().unwrap();
        assert_eq!(chan.state(), ChannelState::Open);
        second.write(Msg::value("again")).await.unwrap();
        assert_eq!(value(fresh.read().await.unwrap()), "again");
        assert_eq!(finished.read().await.unwrap(), Msg::Done);
    }

    #[tokio::test]
    async fn cancelled_read_does_not_finish_the_reader() {
        let chan = Channel::new(1);
        let first = chan.create_writer().unwrap();
        let r = chan.create_reader().unwrap();

        let mut fut = Box::pin(r.read());
        assert!(futures::poll!(&mut fut).is_pending());
        drop(fut);

        first.close().unwrap();
        let second = chan.create_writer().unwrap();
        assert_eq!(chan.reader_count(), 1);
        second.write(Msg::value("fresh")).await.unwrap();
        assert_eq!(value(r.read().await.unwrap()), "fresh");
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn zero_capacity_is_a_bug() {
        let _ = Channel::new(0);
    }
}
