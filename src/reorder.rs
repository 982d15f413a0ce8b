//! Timestamp reordering for solved poses before they reach reporters.

use std::collections::BTreeMap;

/// An item refused because something newer was already emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LateArrival {
    pub timestamp: u64,
    pub last_emitted: u64,
}

/// Bounded per-body buffer that releases items in non-decreasing timestamp order.
///
/// An item is held until the newest timestamp seen is at least `window` ticks
/// past it, or until the buffer is full. Items older than the last released
/// timestamp are refused.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    window: u64,
    capacity: usize,
    pending: BTreeMap<(u64, u64), T>,
    arrivals: u64,
    newest: Option<u64>,
    last_emitted: Option<u64>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(window: u64, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            pending: BTreeMap::new(),
            arrivals: 0,
            newest: None,
            last_emitted: None,
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn last_emitted(&self) -> Option<u64> {
        self.last_emitted
    }

    /// Admit an item and return everything that became releasable, oldest first.
    pub fn push(&mut self, timestamp: u64, item: T) -> Result<Vec<(u64, T)>, LateArrival> {
        if let Some(last) = self.last_emitted {
            if timestamp < last {
                log::debug!("reorder: refusing item at {} (already emitted {})", timestamp, last);
                return Err(LateArrival {
                    timestamp,
                    last_emitted: last,
                });
            }
        }
        self.pending.insert((timestamp, self.arrivals), item);
        self.arrivals += 1;
        self.newest = Some(self.newest.map_or(timestamp, |n| n.max(timestamp)));
        Ok(self.release())
    }

    fn release(&mut self) -> Vec<(u64, T)> {
        let mut out = Vec::new();
        let newest = self.newest.unwrap_or(0);
        loop {
            let held = self.pending.len();
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            let ts = entry.key().0;
            let due = newest.saturating_sub(ts) >= self.window;
            if !due && held <= self.capacity {
                break;
            }
            let item = entry.remove();
            self.last_emitted = Some(ts);
            out.push((ts, item));
        }
        out
    }

    /// Release everything still held.
    pub fn flush(&mut self) -> Vec<(u64, T)> {
        let pending = std::mem::take(&mut self.pending);
        let out: Vec<(u64, T)> = pending.into_iter().map(|((ts, _), item)| (ts, item)).collect();
        if let Some((ts, _)) = out.last() {
            self.last_emitted = Some(*ts);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buffer: &mut ReorderBuffer<u64>, stamps: &[u64]) -> (Vec<u64>, Vec<LateArrival>) {
        let mut out = Vec::new();
        let mut late = Vec::new();
        for &ts in stamps {
            match buffer.push(ts, ts) {
                Ok(released) => out.extend(released.into_iter().map(|(ts, _)| ts)),
                Err(l) => late.push(l),
            }
        }
        out.extend(buffer.flush().into_iter().map(|(ts, _)| ts));
        (out, late)
    }

    #[test]
    fn test_out_of_order_inside_window_is_sorted() {
        let mut buffer = ReorderBuffer::new(15, 16);
        let (out, late) = feed(&mut buffer, &[10, 30, 20, 40]);
        assert_eq!(out, vec![10, 20, 30, 40]);
        assert!(late.is_empty());
    }

    #[test]
    fn test_out_of_order_after_window_is_late() {
        let mut buffer = ReorderBuffer::new(0, 16);
        let (out, late) = feed(&mut buffer, &[10, 30, 20, 40]);
        assert_eq!(out, vec![10, 30, 40]);
        assert_eq!(
            late,
            vec![LateArrival {
                timestamp: 20,
                last_emitted: 30
            }]
        );
    }

    #[test]
    fn test_capacity_forces_release() {
        let mut buffer = ReorderBuffer::new(u64::MAX, 2);
        assert!(buffer.push(1, 1).unwrap().is_empty());
        assert!(buffer.push(2, 2).unwrap().is_empty());
        let released = buffer.push(3, 3).unwrap();
        assert_eq!(released, vec![(1, 1)]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_equal_timestamps_are_not_late() {
        let mut buffer = ReorderBuffer::new(0, 4);
        assert_eq!(buffer.push(5, 1).unwrap(), vec![(5, 1)]);
        assert_eq!(buffer.push(5, 2).unwrap(), vec![(5, 2)]);
    }
}
