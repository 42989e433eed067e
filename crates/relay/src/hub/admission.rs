//! Bounded buffers and the admission policy shared by the reader path
//! (transmit queue + pending buffer) and the forward path (outbound buffer +
//! overflow buffer).
//!
//! Capacity checks are length-then-act. The underlying `try_send` is what
//! actually enforces the bound on a shared buffer, so it never grows past its
//! capacity; a racing admitter can only be turned away early, never let in
//! late.

use std::sync::Arc;

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

/// A bounded MPMC buffer that keeps both ends so any holder can push, pop
/// or close it.
///
/// When used as a backlog, an item taken off the front by a drain that then
/// lost its slot on the shared buffer is parked in `front` and handed out
/// before anything still queued, so backlog order survives the race.
#[derive(Debug)]
pub struct BoundedBuffer<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    front: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for BoundedBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            front: self.front.clone(),
        }
    }
}

impl<T> BoundedBuffer<T> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            front: Arc::new(Mutex::new(None)),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len() + usize::from(self.front.lock().is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.front.lock().is_none() && self.tx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn try_push(&self, item: T) -> Result<(), TrySendError<T>> {
        if self.tx.is_closed() {
            return Err(TrySendError::Closed(item));
        }
        // a parked front item occupies one slot
        if self.front.lock().is_some() && self.tx.len() + 1 >= self.capacity() {
            return Err(TrySendError::Full(item));
        }
        self.tx.try_send(item)
    }

    pub fn try_pop(&self) -> Option<T> {
        if let Some(item) = self.front.lock().take() {
            return Some(item);
        }
        self.rx.try_recv().ok()
    }

    /// Wait for the next item. Items queued before `close` are still
    /// returned; `None` once closed and empty.
    pub async fn recv(&self) -> Option<T> {
        let parked = self.front.lock().take();
        if parked.is_some() {
            return parked;
        }
        self.rx.recv().await.ok()
    }

    /// Returns true only for the call that actually closed the buffer.
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    /// The raw receiving end. It does not see a parked front item, so only
    /// hand it out for buffers that are never drained as a backlog.
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Move items from the front of `self` onto `shared` while it has room.
    /// Concurrent drains of the same backlog are serialized.
    fn drain_into(&self, shared: &BoundedBuffer<T>) -> usize {
        let mut front = self.front.lock();
        let mut moved = 0;
        while !shared.is_full() {
            let item = match front.take() {
                Some(item) => item,
                None => match self.rx.try_recv() {
                    Ok(item) => item,
                    Err(_) => break,
                },
            };
            match shared.try_push(item) {
                Ok(()) => moved += 1,
                Err(TrySendError::Full(item)) | Err(TrySendError::Closed(item)) => {
                    // lost the slot to a concurrent producer; keep our place
                    *front = Some(item);
                    break;
                }
            }
        }
        moved
    }
}

/// Where an admitted item ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// Placed on the shared buffer
    Direct,
    /// Parked on the private backlog buffer
    Buffered,
    /// Both buffers full; the caller owns the item again
    Rejected(T),
    /// The shared buffer has been closed
    Closed(T),
}

impl<T> Admission<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Direct | Admission::Buffered)
    }
}

/// Move backlog items onto `shared` while it has room, oldest first.
/// Returns how many moved.
pub fn drain_backlog<T>(shared: &BoundedBuffer<T>, backlog: &BoundedBuffer<T>) -> usize {
    backlog.drain_into(shared)
}

/// The 3-tier policy: drain the backlog first, then admit directly, then
/// park on the backlog, else reject. A new item never overtakes anything
/// still waiting on the backlog.
pub fn admit<T>(
    shared: &BoundedBuffer<T>,
    backlog: Option<&BoundedBuffer<T>>,
    item: T,
) -> Admission<T> {
    if shared.is_closed() {
        return Admission::Closed(item);
    }

    if let Some(backlog) = backlog {
        drain_backlog(shared, backlog);
    }

    let mut item = item;
    let backlog_empty = backlog.is_none_or(|backlog| backlog.is_empty());
    if backlog_empty && !shared.is_full() {
        match shared.try_push(item) {
            Ok(()) => return Admission::Direct,
            Err(TrySendError::Full(back)) => item = back,
            Err(TrySendError::Closed(back)) => return Admission::Closed(back),
        }
    }

    match backlog {
        Some(backlog) => match backlog.try_push(item) {
            Ok(()) => Admission::Buffered,
            Err(TrySendError::Full(back)) => Admission::Rejected(back),
            Err(TrySendError::Closed(back)) => Admission::Closed(back),
        },
        None => Admission::Rejected(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T>(buffer: &BoundedBuffer<T>) -> Vec<T> {
        std::iter::from_fn(|| buffer.try_pop()).collect()
    }

    #[test]
    fn admits_directly_below_capacity() {
        let shared = BoundedBuffer::new(3);
        for i in 0..3 {
            assert!(shared.len() < shared.capacity());
            assert_eq!(admit(&shared, None, i), Admission::Direct);
            assert!(shared.len() <= shared.capacity());
        }
        assert_eq!(admit(&shared, None, 3), Admission::Rejected(3));
        assert_eq!(shared.len(), 3);
    }

    #[test]
    fn capacity_two_without_backlog_rejects_exactly_the_third() {
        let shared = BoundedBuffer::new(2);
        let outcomes: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|m| admit(&shared, None, m))
            .collect();

        assert_eq!(
            outcomes,
            vec![Admission::Direct, Admission::Direct, Admission::Rejected("c")]
        );
        assert_eq!(drain(&shared), vec!["a", "b"]);
    }

    #[test]
    fn full_shared_buffer_parks_on_backlog_then_rejects() {
        let shared = BoundedBuffer::new(1);
        let backlog = BoundedBuffer::new(1);

        assert_eq!(admit(&shared, Some(&backlog), 1), Admission::Direct);
        assert_eq!(admit(&shared, Some(&backlog), 2), Admission::Buffered);
        assert_eq!(admit(&shared, Some(&backlog), 3), Admission::Rejected(3));
    }

    #[test]
    fn backlog_drains_ahead_of_new_items() {
        let shared = BoundedBuffer::new(2);
        let backlog = BoundedBuffer::new(4);

        admit(&shared, Some(&backlog), 1);
        admit(&shared, Some(&backlog), 2);
        assert_eq!(admit(&shared, Some(&backlog), 3), Admission::Buffered);
        assert_eq!(admit(&shared, Some(&backlog), 4), Admission::Buffered);

        // the consumer frees both slots
        assert_eq!(drain(&shared), vec![1, 2]);

        // 3 and 4 move first, so 5 must wait behind them
        assert_eq!(admit(&shared, Some(&backlog), 5), Admission::Buffered);
        assert_eq!(drain(&shared), vec![3, 4]);
        assert_eq!(drain_backlog(&shared, &backlog), 1);
        assert_eq!(drain(&shared), vec![5]);
    }

    #[test]
    fn closed_shared_buffer_returns_the_item() {
        let shared = BoundedBuffer::new(1);
        let backlog = BoundedBuffer::new(1);
        assert!(shared.close());
        assert!(!shared.close());
        assert_eq!(admit(&shared, Some(&backlog), 7), Admission::Closed(7));
        assert!(backlog.is_empty());
    }

    #[test]
    fn lost_slot_keeps_backlog_order() {
        let backlog = BoundedBuffer::new(3);
        for i in 1..=3 {
            backlog.try_push(i).unwrap();
        }
        // reports room but refuses the push, like a slot taken by a racer
        let shared = BoundedBuffer::new(4);
        shared.close();

        assert_eq!(drain_backlog(&shared, &backlog), 0);
        assert_eq!(backlog.len(), 3);
        assert!(backlog.is_full());
        assert!(backlog.try_push(4).is_err());
        assert_eq!(drain(&backlog), vec![1, 2, 3]);
    }

    #[test]
    fn parked_front_item_moves_first() {
        let backlog = BoundedBuffer::new(3);
        backlog.try_push("a").unwrap();
        backlog.try_push("b").unwrap();

        let closed = BoundedBuffer::new(1);
        closed.close();
        drain_backlog(&closed, &backlog);

        let shared = BoundedBuffer::new(4);
        assert_eq!(drain_backlog(&shared, &backlog), 2);
        assert_eq!(drain(&shared), vec!["a", "b"]);
        assert!(backlog.is_empty());
    }

    #[test]
    fn new_item_waits_behind_backlog() {
        let shared = BoundedBuffer::new(1);
        let backlog = BoundedBuffer::new(2);
        admit(&shared, Some(&backlog), 1);
        admit(&shared, Some(&backlog), 2);

        // consumer takes 1; 2 fills the freed slot, so 3 must park
        assert_eq!(shared.try_pop(), Some(1));
        assert_eq!(admit(&shared, Some(&backlog), 3), Admission::Buffered);
        assert_eq!(drain(&shared), vec![2]);
        assert_eq!(drain(&backlog), vec![3]);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let buffer = BoundedBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(admit(&buffer, None, "only"), Admission::Direct);
        assert_eq!(admit(&buffer, None, "extra"), Admission::Rejected("extra"));
    }

    #[tokio::test]
    async fn concurrent_admitters_never_overfill() {
        let shared = BoundedBuffer::new(8);
        let mut handles = Vec::new();
        for worker in 0..16 {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                let backlog = BoundedBuffer::new(2);
                let mut accepted = 0;
                for i in 0..4 {
                    if admit(&shared, Some(&backlog), worker * 100 + i).is_accepted() {
                        accepted += 1;
                    }
                    assert!(shared.len() <= shared.capacity());
                }
                accepted
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(shared.len() <= 8);
    }
}
