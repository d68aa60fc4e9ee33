//! The write-batching send queue.
//!
//! Entries own their data; a greedy batcher coalesces queue heads into one
//! vectored syscall. Partial writes advance the head's `data_offset`, fully
//! drained entries surface their callbacks, and one-shot watermark flags
//! gate production. Zero-copy entries stay alive past their last byte until
//! the kernel acknowledges every in-flight range.

use std::collections::{HashMap, VecDeque};

use sockeye_timing::{Nanos, TimerHandle};
use sockeye_utils::safe_panic;

use crate::{
    buffer::{Data, FileRegion},
    endpoint::Endpoint,
    error::{Error, ErrorKind, Result},
    queue::{CancelToken, Watermarks},
    sys,
};

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub token: Option<CancelToken>,
    pub deadline: Option<Nanos>,
    /// Caps the number of buffers this entry allows in a gather batch it
    /// participates in.
    pub max_buffers: Option<usize>,
    pub zero_copy: bool,
    /// Datagram target on unconnected sockets; ignored by streams.
    pub destination: Option<Endpoint>,
}

/// Completion of one send entry.
#[derive(Debug)]
pub struct SendEvent {
    pub id: u64,
    pub result: Result<()>,
}

pub(crate) type SendCallback = Box<dyn FnOnce(SendEvent) + Send>;

pub(crate) struct SendQueueEntry {
    pub(crate) id: u64,
    data: Data,
    length: usize,
    data_offset: usize,
    token: Option<CancelToken>,
    max_buffers: Option<usize>,
    zero_copy: bool,
    destination: Option<Endpoint>,
    callback: Option<SendCallback>,
    /// Zero-copy syscalls not yet acknowledged by the kernel.
    in_flight: u32,
    pub(crate) timer: Option<TimerHandle>,
}

impl SendQueueEntry {
    #[inline]
    fn remaining(&self) -> usize {
        self.length - self.data_offset
    }
}

/// The next syscall the batcher wants issued.
pub(crate) enum Batch {
    /// Coalesced in-memory slices for one `sendmsg`. `destination` is set
    /// for message-oriented (single-entry) batches on unconnected sockets.
    Gather { iovecs: Vec<libc::iovec>, zero_copy: bool, destination: Option<Endpoint> },
    /// A file region for one `sendfile`; never mixed into a gather batch so
    /// the gather path stays uniformly `sendmsg`.
    File(FileRegion),
}

/// Callbacks and interest changes produced by a queue mutation, to be acted
/// on after the socket lock is released.
#[derive(Default)]
pub(crate) struct SendProgress {
    pub(crate) completions: Vec<(SendCallback, SendEvent)>,
    pub(crate) low_watermark: bool,
}

pub(crate) struct SendQueue {
    entries: VecDeque<SendQueueEntry>,
    next_id: u64,
    size: usize,
    watermarks: Watermarks,
    /// Kernel zero-copy sequence mirror: one per `MSG_ZEROCOPY` sendmsg.
    zc_next_seq: u32,
    /// Sequence number to the entries the syscall touched.
    zc_outstanding: HashMap<u32, Vec<u64>>,
    /// Drained entries still waiting on zero-copy acknowledgements.
    zc_parked: Vec<SendQueueEntry>,
}

impl SendQueue {
    pub(crate) fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            size: 0,
            watermarks: Watermarks::new(low_watermark, high_watermark),
            zc_next_seq: 0,
            zc_outstanding: HashMap::new(),
            zc_parked: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub(crate) fn has_zero_copy_parked(&self) -> bool {
        !self.zc_parked.is_empty()
    }

    /// True while any zero-copy syscall awaits kernel acknowledgement.
    #[inline]
    pub(crate) fn has_zero_copy_outstanding(&self) -> bool {
        !self.zc_outstanding.is_empty() || !self.zc_parked.is_empty()
    }

    /// Appends an entry. Fails with `WouldBlock` while the queue sits at or
    /// over its high watermark; the enqueue that reaches the watermark
    /// succeeds and reports `high_watermark = true` exactly once.
    pub(crate) fn enqueue(
        &mut self,
        data: Data,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(u64, bool)> {
        if self.watermarks.saturated(self.size) {
            return Err(Error::new(ErrorKind::WouldBlock));
        }
        let length = data.len();
        if length == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(SendQueueEntry {
            id,
            data,
            length,
            data_offset: 0,
            token: options.token,
            max_buffers: options.max_buffers,
            zero_copy: options.zero_copy,
            destination: options.destination,
            callback,
            in_flight: 0,
            timer: None,
        });
        self.size += length;
        let high = self.watermarks.authorize_high(self.size);
        Ok((id, high))
    }

    pub(crate) fn set_entry_timer(&mut self, id: u64, timer: TimerHandle) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.timer = Some(timer);
        }
    }

    /// Greedily gathers queue heads into the next syscall.
    ///
    /// With `message_oriented` set, only the head entry joins the batch so
    /// datagram boundaries survive.
    ///
    /// The returned iovecs point into entry-owned heap data; they stay valid
    /// until the queue is next mutated, so the caller must issue the syscall
    /// before touching the queue again (it holds the socket lock throughout).
    pub(crate) fn prepare_batch(
        &self,
        default_max_buffers: usize,
        message_oriented: bool,
    ) -> Option<Batch> {
        let first = self.entries.front()?;

        if let Data::File(region) = &first.data {
            let mut region = *region;
            region.offset += first.data_offset as u64;
            region.remaining = first.remaining() as u64;
            return Some(Batch::File(region));
        }

        let zero_copy = first.zero_copy;
        let destination = first.destination.clone();
        let mut limit = default_max_buffers.min(sys::MAX_GATHER_BUFFERS);
        let mut iovecs = Vec::new();

        for entry in &self.entries {
            if matches!(entry.data, Data::File(_)) || entry.zero_copy != zero_copy {
                break;
            }
            if (message_oriented || entry.destination.is_some()) && !iovecs.is_empty() {
                break;
            }
            if let Some(max) = entry.max_buffers {
                limit = limit.min(max);
            }
            if iovecs.len() >= limit {
                break;
            }

            let mut skip = entry.data_offset;
            match &entry.data {
                Data::Bytes(bytes) => {
                    iovecs.push(libc::iovec {
                        iov_base: bytes[skip..].as_ptr().cast_mut().cast(),
                        iov_len: bytes.len() - skip,
                    });
                }
                Data::Blob(blob) => {
                    for slice in blob.iter_slices() {
                        if skip >= slice.len() {
                            skip -= slice.len();
                            continue;
                        }
                        if iovecs.len() >= limit {
                            break;
                        }
                        iovecs.push(libc::iovec {
                            iov_base: slice[skip..].as_ptr().cast_mut().cast(),
                            iov_len: slice.len() - skip,
                        });
                        skip = 0;
                    }
                }
                Data::File(_) => {
                    safe_panic!("file entry reached the gather batcher");
                    break;
                }
            }
            if iovecs.len() >= limit {
                break;
            }
        }

        if iovecs.is_empty() {
            None
        } else {
            Some(Batch::Gather { iovecs, zero_copy, destination })
        }
    }

    /// Accounts for `written` bytes leaving the head of the queue.
    ///
    /// `zero_copy_sent` marks that the syscall carried `MSG_ZEROCOPY`; the
    /// kernel's completion for it is the next sequence number.
    pub(crate) fn consume(&mut self, mut written: usize, zero_copy_sent: bool) -> SendProgress {
        let mut progress = SendProgress::default();

        if zero_copy_sent {
            let seq = self.zc_next_seq;
            self.zc_next_seq = self.zc_next_seq.wrapping_add(1);
            // The completion covers every entry the syscall touched; charge
            // it to each.
            let mut touched = Vec::new();
            let mut remaining = written;
            for entry in &mut self.entries {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(entry.remaining());
                entry.in_flight += 1;
                touched.push(entry.id);
                remaining -= take;
            }
            self.zc_outstanding.insert(seq, touched);
        }

        self.size -= written.min(self.size);
        while written > 0 {
            let Some(front) = self.entries.front_mut() else {
                break;
            };
            let take = written.min(front.remaining());
            front.data_offset += take;
            written -= take;
            if front.remaining() > 0 {
                break;
            }
            let Some(mut entry) = self.entries.pop_front() else {
                safe_panic!("drained send entry vanished from the queue");
                break;
            };
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
            if entry.in_flight > 0 {
                self.zc_parked.push(entry);
            } else if let Some(callback) = entry.callback.take() {
                progress
                    .completions
                    .push((callback, SendEvent { id: entry.id, result: Ok(()) }));
            }
        }

        progress.low_watermark = self.watermarks.authorize_low(self.size);
        progress
    }

    /// Applies kernel zero-copy acknowledgement ranges.
    pub(crate) fn acknowledge_zero_copy(&mut self, ranges: &[(u32, u32)]) -> SendProgress {
        let mut progress = SendProgress::default();
        for &(lo, hi) in ranges {
            let mut seq = lo;
            loop {
                if let Some(ids) = self.zc_outstanding.remove(&seq) {
                    for id in ids {
                        for entry in &mut self.entries {
                            if entry.id == id {
                                entry.in_flight = entry.in_flight.saturating_sub(1);
                            }
                        }
                        for entry in &mut self.zc_parked {
                            if entry.id == id {
                                entry.in_flight = entry.in_flight.saturating_sub(1);
                            }
                        }
                    }
                }
                if seq == hi {
                    break;
                }
                seq = seq.wrapping_add(1);
            }
        }

        let mut index = 0;
        while index < self.zc_parked.len() {
            if self.zc_parked[index].in_flight == 0 {
                let mut entry = self.zc_parked.swap_remove(index);
                if let Some(callback) = entry.callback.take() {
                    progress
                        .completions
                        .push((callback, SendEvent { id: entry.id, result: Ok(()) }));
                }
            } else {
                index += 1;
            }
        }
        progress
    }

    /// Removes entries matching `token` and completes them with `Cancelled`.
    /// Partially written heads and entries with zero-copy writes in flight
    /// stay.
    pub(crate) fn cancel(&mut self, token: CancelToken) -> SendProgress {
        self.remove_matching(
            |entry| entry.token == Some(token),
            Error::new(ErrorKind::Cancelled),
        )
    }

    /// Removes a specific entry on deadline expiry.
    pub(crate) fn expire(&mut self, id: u64) -> SendProgress {
        self.remove_matching(|entry| entry.id == id, Error::new(ErrorKind::TimedOut))
    }

    fn remove_matching(
        &mut self,
        mut matches: impl FnMut(&SendQueueEntry) -> bool,
        error: Error,
    ) -> SendProgress {
        let mut progress = SendProgress::default();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        while let Some(mut entry) = self.entries.pop_front() {
            let removable = matches(&entry) && entry.data_offset == 0 && entry.in_flight == 0;
            if removable {
                self.size -= entry.length;
                if let Some(timer) = entry.timer.take() {
                    timer.cancel();
                }
                if let Some(callback) = entry.callback.take() {
                    progress
                        .completions
                        .push((callback, SendEvent { id: entry.id, result: Err(error) }));
                }
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        progress.low_watermark = self.watermarks.authorize_low(self.size);
        progress
    }

    /// Terminal error: every entry completes with `error`, the queue empties.
    pub(crate) fn fail_all(&mut self, error: Error) -> SendProgress {
        let mut progress = SendProgress::default();
        for mut entry in self.entries.drain(..).chain(self.zc_parked.drain(..)) {
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
            if let Some(callback) = entry.callback.take() {
                progress
                    .completions
                    .push((callback, SendEvent { id: entry.id, result: Err(error) }));
            }
        }
        self.size = 0;
        self.zc_outstanding.clear();
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: usize) -> Data {
        Data::Bytes(vec![0xA5; n])
    }

    #[test]
    fn size_tracks_remaining_bytes() {
        let mut queue = SendQueue::new(0, usize::MAX);
        queue.enqueue(bytes(100), SendOptions::default(), None).unwrap();
        queue.enqueue(bytes(50), SendOptions::default(), None).unwrap();
        assert_eq!(queue.size(), 150);

        // Partial write drains the head only.
        queue.consume(30, false);
        assert_eq!(queue.size(), 120);
        queue.consume(70, false);
        assert_eq!(queue.size(), 50);
        queue.consume(50, false);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn ids_are_monotonic() {
        let mut queue = SendQueue::new(0, usize::MAX);
        let (a, _) = queue.enqueue(bytes(1), SendOptions::default(), None).unwrap();
        let (b, _) = queue.enqueue(bytes(1), SendOptions::default(), None).unwrap();
        assert!(b > a);
    }

    #[test]
    fn watermark_alternation() {
        const M: usize = 1024;
        let mut queue = SendQueue::new(0, 2 * M);

        let (_, high) = queue.enqueue(bytes(M), SendOptions::default(), None).unwrap();
        assert!(!high);
        let (_, high) = queue.enqueue(bytes(M), SendOptions::default(), None).unwrap();
        assert!(high, "exactly one high authorization");

        // Saturated: further enqueues observe WouldBlock.
        let err = queue.enqueue(bytes(1), SendOptions::default(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        let progress = queue.consume(M, false);
        assert!(!progress.low_watermark, "still above low");
        let progress = queue.consume(M, false);
        assert!(progress.low_watermark, "exactly one low authorization");
    }

    #[test]
    fn gather_batch_coalesces_entries() {
        let mut queue = SendQueue::new(0, usize::MAX);
        queue.enqueue(bytes(10), SendOptions::default(), None).unwrap();
        queue.enqueue(bytes(20), SendOptions::default(), None).unwrap();

        match queue.prepare_batch(16, false).unwrap() {
            Batch::Gather { iovecs, zero_copy, destination } => {
                assert_eq!(iovecs.len(), 2);
                assert_eq!(iovecs[0].iov_len, 10);
                assert_eq!(iovecs[1].iov_len, 20);
                assert!(!zero_copy);
                assert!(destination.is_none());
            }
            Batch::File(_) => panic!("expected gather"),
        }
    }

    #[test]
    fn partial_write_offsets_next_batch() {
        let mut queue = SendQueue::new(0, usize::MAX);
        queue.enqueue(bytes(100), SendOptions::default(), None).unwrap();
        queue.consume(40, false);

        match queue.prepare_batch(16, false).unwrap() {
            Batch::Gather { iovecs, .. } => {
                assert_eq!(iovecs.len(), 1);
                assert_eq!(iovecs[0].iov_len, 60);
            }
            Batch::File(_) => panic!("expected gather"),
        }
    }

    #[test]
    fn file_entries_never_join_gather_batches() {
        let mut queue = SendQueue::new(0, usize::MAX);
        queue.enqueue(bytes(10), SendOptions::default(), None).unwrap();
        queue
            .enqueue(
                Data::File(FileRegion { fd: 9, offset: 0, remaining: 500 }),
                SendOptions::default(),
                None,
            )
            .unwrap();

        // First batch: the in-memory head only.
        match queue.prepare_batch(16, false).unwrap() {
            Batch::Gather { iovecs, .. } => assert_eq!(iovecs.len(), 1),
            Batch::File(_) => panic!("expected gather first"),
        }
        queue.consume(10, false);

        // Second batch: the file region alone.
        match queue.prepare_batch(16, false).unwrap() {
            Batch::File(region) => {
                assert_eq!(region.fd, 9);
                assert_eq!(region.remaining, 500);
            }
            Batch::Gather { .. } => panic!("expected file batch"),
        }
    }

    #[test]
    fn max_buffers_caps_the_batch() {
        let mut queue = SendQueue::new(0, usize::MAX);
        for _ in 0..8 {
            queue.enqueue(bytes(4), SendOptions::default(), None).unwrap();
        }
        match queue.prepare_batch(3, false).unwrap() {
            Batch::Gather { iovecs, .. } => assert_eq!(iovecs.len(), 3),
            Batch::File(_) => panic!("expected gather"),
        }

        // A per-entry limit tightens the cap further.
        let mut queue = SendQueue::new(0, usize::MAX);
        queue
            .enqueue(bytes(4), SendOptions { max_buffers: Some(1), ..Default::default() }, None)
            .unwrap();
        queue.enqueue(bytes(4), SendOptions::default(), None).unwrap();
        match queue.prepare_batch(16, false).unwrap() {
            Batch::Gather { iovecs, .. } => assert_eq!(iovecs.len(), 1),
            Batch::File(_) => panic!("expected gather"),
        }
    }

    #[test]
    fn completed_entries_fire_callbacks_in_order() {
        let mut queue = SendQueue::new(0, usize::MAX);
        let (first_id, _) = queue
            .enqueue(
                bytes(10),
                SendOptions::default(),
                Some(Box::new(|event| assert!(event.result.is_ok()))),
            )
            .unwrap();
        queue
            .enqueue(
                bytes(10),
                SendOptions::default(),
                Some(Box::new(|event| assert!(event.result.is_ok()))),
            )
            .unwrap();

        let progress = queue.consume(15, false);
        assert_eq!(progress.completions.len(), 1);
        assert_eq!(progress.completions[0].1.id, first_id);

        let progress = queue.consume(5, false);
        assert_eq!(progress.completions.len(), 1);
        for (callback, event) in progress.completions {
            callback(event);
        }
    }

    #[test]
    fn cancel_skips_partially_written_head() {
        let token = CancelToken(3);
        let mut queue = SendQueue::new(0, usize::MAX);
        queue
            .enqueue(bytes(10), SendOptions { token: Some(token), ..Default::default() }, None)
            .unwrap();
        queue
            .enqueue(bytes(10), SendOptions { token: Some(token), ..Default::default() }, None)
            .unwrap();
        queue.consume(4, false);

        let progress = queue.cancel(token);
        // Only the untouched second entry was removed.
        assert_eq!(progress.completions.len(), 1);
        assert_eq!(queue.size(), 6);
    }

    #[test]
    fn zero_copy_entry_waits_for_acknowledgement() {
        let mut queue = SendQueue::new(0, usize::MAX);
        let completed = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = std::sync::Arc::clone(&completed);
        queue
            .enqueue(
                bytes(10),
                SendOptions { zero_copy: true, ..Default::default() },
                Some(Box::new(move |event| {
                    assert!(event.result.is_ok());
                    c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })),
            )
            .unwrap();

        let progress = queue.consume(10, true);
        // Fully written, but the callback is parked until the kernel acks.
        assert!(progress.completions.is_empty());
        assert!(queue.has_zero_copy_parked());

        let progress = queue.acknowledge_zero_copy(&[(0, 0)]);
        assert_eq!(progress.completions.len(), 1);
        for (callback, event) in progress.completions {
            callback(event);
        }
        assert_eq!(completed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!queue.has_zero_copy_parked());
    }

    #[test]
    fn fail_all_completes_everything_with_the_error() {
        let mut queue = SendQueue::new(0, usize::MAX);
        for _ in 0..3 {
            queue
                .enqueue(
                    bytes(5),
                    SendOptions::default(),
                    Some(Box::new(|event: SendEvent| {
                        assert_eq!(event.result.unwrap_err().kind(), ErrorKind::ConnectionReset);
                    })),
                )
                .unwrap();
        }
        let progress = queue.fail_all(Error::new(ErrorKind::ConnectionReset));
        assert_eq!(progress.completions.len(), 3);
        assert_eq!(queue.size(), 0);
        for (callback, event) in progress.completions {
            callback(event);
        }
    }
}
