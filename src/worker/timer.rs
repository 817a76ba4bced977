//! Worker timers ordered by deadline

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Duration;

use tokio::time::Instant;

use super::Worker;

/// Shortest period of a repeating timer; a zero period would never let a
/// firing pass finish
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub(super) type TimerCallback = Box<dyn FnMut(&Rc<Worker>)>;

/// Handle returned by [`Worker::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Timer {
    interval: Option<Duration>,
    callback: TimerCallback,
}

#[derive(Default)]
pub(super) struct Timers {
    next_id: u64,
    queue: BTreeMap<(Instant, u64), Timer>,
    /// Live timers (queued or currently firing) and their deadline
    live: HashMap<u64, (Instant, Option<Duration>)>,
}

impl Timers {
    pub(super) fn insert(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerHandle {
        let interval = interval.map(|i| i.max(MIN_INTERVAL));
        self.next_id += 1;
        let id = self.next_id;
        self.queue.insert((deadline, id), Timer { interval, callback });
        self.live.insert(id, (deadline, interval));
        TimerHandle(id)
    }

    pub(super) fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.live.remove(&handle.0) {
            Some((deadline, _)) => {
                self.queue.remove(&(deadline, handle.0));
                true
            }
            None => false,
        }
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Take the earliest timer if it is due at `now`
    pub(super) fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, TimerCallback)> {
        let (&(deadline, id), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        let timer = self.queue.remove(&(deadline, id))?;
        if timer.interval.is_none() {
            self.live.remove(&id);
        }
        Some((TimerHandle(id), timer.callback))
    }

    /// Requeue a repeating timer after it fired, unless it was cancelled meanwhile
    pub(super) fn rearm(&mut self, handle: TimerHandle, callback: TimerCallback) {
        let Some((deadline, Some(interval))) = self.live.get(&handle.0).copied() else {
            return;
        };
        let next = deadline + interval;
        self.live.insert(handle.0, (next, Some(interval)));
        self.queue.insert(
            (next, handle.0),
            Timer {
                interval: Some(interval),
                callback,
            },
        );
    }

    pub(super) fn clear(&mut self) {
        self.queue.clear();
        self.live.clear();
    }
}
