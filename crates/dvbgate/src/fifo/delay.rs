//! Time-keyed FIFO used to emulate propagation delay.
//!
//! Elements are keyed by their release instant. The queue is internally
//! serialised; waking up close to the next due release is the caller's
//! business (the delay timer of the physical-layer channels polls it).
//!
//! Timestamps are plain milliseconds on whatever monotonic clock the caller
//! uses, which keeps releases deterministic under test.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::VolPkt;

#[derive(Debug)]
struct Element<T> {
    tick_out: u64,
    value: T,
}

#[derive(Debug, Default)]
struct Inner<T> {
    queue: BTreeMap<(u64, u64), Element<T>>,
    seq: u64,
    max_size_pkt: VolPkt,
}

/// Outcome of one step of [`DelayFifo::scan`].
pub enum ScanAction {
    Keep,
    Erase,
}

#[derive(Debug)]
pub struct DelayFifo<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> DelayFifo<T> {
    pub fn new(max_size_pkt: VolPkt) -> Self {
        DelayFifo {
            inner: Mutex::new(Inner {
                queue: BTreeMap::new(),
                seq: 0,
                max_size_pkt,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    pub fn max_size_pkt(&self) -> VolPkt {
        self.inner.lock().unwrap().max_size_pkt
    }

    /// Shrink or grow the bound; refused when smaller than the current
    /// backlog.
    pub fn set_max_size_pkt(&self, max_size_pkt: VolPkt) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() as VolPkt > max_size_pkt {
            return false;
        }
        inner.max_size_pkt = max_size_pkt;
        true
    }

    /// Queue `value` for release at `now_ms + duration_ms`. Returns false
    /// when the queue is full.
    pub fn push(&self, value: T, duration_ms: u64, now_ms: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() as VolPkt >= inner.max_size_pkt {
            return false;
        }
        let tick_out = now_ms + duration_ms;
        let seq = inner.seq;
        inner.seq += 1;
        inner.queue.insert((tick_out, seq), Element { tick_out, value });
        true
    }

    /// Remove and return the element with the earliest release instant,
    /// regardless of whether it is due.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let key = *inner.queue.keys().next()?;
        inner.queue.remove(&key).map(|elem| elem.value)
    }

    /// Remove and return every element due at `now_ms`, earliest first.
    ///
    /// The deadline is frozen on entry: elements becoming due while the
    /// caller consumes the result are left for the next poll.
    pub fn take_due(&self, now_ms: u64) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        while let Some(key) = inner.queue.keys().next().copied() {
            if key.0 > now_ms {
                break;
            }
            if let Some(elem) = inner.queue.remove(&key) {
                due.push(elem.value);
            }
        }
        due
    }

    /// Visit every element in ascending release order; the callback may
    /// mutate elements in place or erase them.
    pub fn scan(&self, mut visit: impl FnMut(u64, &mut T) -> ScanAction) {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<_> = inner.queue.keys().copied().collect();
        for key in keys {
            let action = match inner.queue.get_mut(&key) {
                Some(elem) => visit(elem.tick_out, &mut elem.value),
                None => continue,
            };
            if let ScanAction::Erase = action {
                inner.queue.remove(&key);
            }
        }
    }

    pub fn flush(&self) {
        self.inner.lock().unwrap().queue.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn releases_in_due_order() {
        let fifo = DelayFifo::new(16);
        assert!(fifo.push("A", 10, 0));
        assert!(fifo.push("B", 5, 0));
        assert!(fifo.push("C", 20, 0));

        // at t=12, B then A are due, C is not
        assert_eq!(fifo.take_due(12), vec!["B", "A"]);
        assert_eq!(fifo.len(), 1);

        assert_eq!(fifo.take_due(19), Vec::<&str>::new());
        assert_eq!(fifo.take_due(25), vec!["C"]);
        assert!(fifo.is_empty());
    }

    #[test]
    fn pop_ignores_deadlines() {
        let fifo = DelayFifo::new(16);
        fifo.push(1, 100, 0);
        fifo.push(2, 50, 0);
        assert_eq!(fifo.pop(), Some(2));
        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.pop(), None);
    }

    #[test]
    fn bounded() {
        let fifo = DelayFifo::new(2);
        assert!(fifo.push(1, 0, 0));
        assert!(fifo.push(2, 0, 0));
        assert!(!fifo.push(3, 0, 0));

        assert!(!fifo.set_max_size_pkt(1));
        assert!(fifo.set_max_size_pkt(4));
        assert!(fifo.push(3, 0, 0));
    }

    #[test]
    fn ties_release_together() {
        let fifo = DelayFifo::new(16);
        fifo.push("first", 10, 0);
        fifo.push("second", 10, 0);
        let due = fifo.take_due(10);
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn scan_can_erase_and_mutate() {
        let fifo = DelayFifo::new(16);
        fifo.push(1, 10, 0);
        fifo.push(2, 20, 0);
        fifo.push(3, 30, 0);

        fifo.scan(|_, value| {
            if *value == 2 {
                ScanAction::Erase
            } else {
                *value *= 10;
                ScanAction::Keep
            }
        });

        assert_eq!(fifo.take_due(100), vec![10, 30]);
    }
}
