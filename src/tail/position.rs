use crate::source::position::LogPosition;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Holds the last acknowledged log position.
///
/// Only the log reader owns the tracker; everyone else observes it through
/// a [`PositionWatch`].
pub struct PositionTracker {
    tx: watch::Sender<Option<LogPosition>>,
}

impl PositionTracker {
    /// `None` means "tail from now".
    pub fn new(initial: Option<LogPosition>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> Option<LogPosition> {
        *self.tx.borrow()
    }

    /// Move forward to `position` if it is strictly after the current one.
    /// Replaying an old or equal position is a no-op.
    pub fn advance(&self, position: LogPosition) -> bool {
        self.tx.send_if_modified(|current| match current {
            Some(existing) if !position.is_after(existing) => false,
            _ => {
                *current = Some(position);
                true
            }
        })
    }

    pub fn subscribe(&self) -> PositionWatch {
        PositionWatch(self.tx.subscribe())
    }
}

#[derive(Clone)]
pub struct PositionWatch(watch::Receiver<Option<LogPosition>>);

impl PositionWatch {
    pub fn current(&self) -> Option<LogPosition> {
        *self.0.borrow()
    }
}

/// Tracks log-origin operations between the reader and the dispatcher.
///
/// Each operation gets a contiguous sequence number. Acknowledgements may
/// arrive in any order; the window reports the position that is safe to
/// persist, i.e. the position of the newest operation such that it and
/// every earlier one has been acknowledged.
#[derive(Debug, Default)]
pub struct AckWindow {
    next_seq: u64,
    pending: BTreeMap<u64, Slot>,
}

#[derive(Debug)]
struct Slot {
    position: LogPosition,
    done: bool,
}

impl AckWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, position: LogPosition) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            Slot {
                position,
                done: false,
            },
        );
        seq
    }

    /// Record a log entry that produced no operation. Returns the position
    /// to advance to right away when nothing is in flight; otherwise the
    /// skip is folded into the newest pending operation.
    pub fn skip(&mut self, position: LogPosition) -> Option<LogPosition> {
        match self.pending.last_entry() {
            Some(mut last) => {
                last.get_mut().position = position;
                None
            }
            None => Some(position),
        }
    }

    pub fn complete(&mut self, seq: u64) -> Option<LogPosition> {
        match self.pending.get_mut(&seq) {
            Some(slot) => slot.done = true,
            None => return None,
        }

        let mut advanced = None;
        while let Some(first) = self.pending.first_entry() {
            if !first.get().done {
                break;
            }
            advanced = Some(first.remove().position);
        }
        advanced
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
