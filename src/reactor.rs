use std::{cmp::Ordering, collections::BinaryHeap, io, time::Duration};

use mio::{event::Source, Events, Interest, Poll, Token};

use crate::time_us;

/// Readiness reported for one registered socket.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Single-threaded readiness reactor: file-descriptor registrations plus
/// timed events with millisecond resolution.
///
/// Timers are drained once per loop iteration, so a timer scheduled from
/// within event dispatch never fires before the next iteration.
pub struct Reactor<T> {
    poll: Poll,
    events: Events,
    timers: BinaryHeap<Entry<T>>,
    seq: u64,
    stopped: bool,
}

struct Entry<T> {
    at_ms: u64,
    seq: u64,
    what: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the nearest deadline is on top.
        (other.at_ms, other.seq).cmp(&(self.at_ms, self.seq))
    }
}

impl<T> Reactor<T> {
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let m = Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            timers: BinaryHeap::new(),
            seq: 0,
            stopped: false,
        };

        Ok(m)
    }

    pub fn register<S: Source>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S: Source>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: Source>(&mut self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Arms a one-shot timer `delay_ms` from now. Rescheduling on expiry is
    /// the dispatcher's call, which makes a timer periodic.
    pub fn schedule(&mut self, delay_ms: u64, what: T) {
        self.seq += 1;
        self.timers.push(Entry {
            at_ms: now_ms() + delay_ms,
            seq: self.seq,
            what,
        });
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Waits for readiness or the nearest timer deadline and collects the
    /// ready set into `ready`.
    pub fn poll(&mut self, ready: &mut Vec<Ready>) -> io::Result<()> {
        ready.clear();

        let timeout = self
            .timers
            .peek()
            .map(|e| Duration::from_millis(e.at_ms.saturating_sub(now_ms())));

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for ev in self.events.iter() {
            ready.push(Ready {
                token: ev.token(),
                readable: ev.is_readable() || ev.is_read_closed() || ev.is_error(),
                writable: ev.is_writable() || ev.is_write_closed() || ev.is_error(),
            });
        }

        Ok(())
    }

    /// Drains every timer due by now into `due`, in deadline order.
    pub fn expired(&mut self, due: &mut Vec<T>) {
        due.clear();

        let now = now_ms();
        while let Some(e) = self.timers.peek() {
            if e.at_ms > now {
                break;
            }
            if let Some(e) = self.timers.pop() {
                due.push(e.what);
            }
        }
    }
}

fn now_ms() -> u64 {
    time_us() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut reactor: Reactor<u32> = Reactor::with_capacity(16).unwrap();
        reactor.schedule(0, 1);
        reactor.schedule(0, 2);
        reactor.schedule(10_000, 3);

        let mut due = Vec::new();
        reactor.expired(&mut due);

        assert_eq!(due, vec![1, 2]);
        reactor.expired(&mut due);
        assert!(due.is_empty());
    }

    #[test]
    fn poll_wakes_for_timer() {
        let mut reactor: Reactor<u32> = Reactor::with_capacity(16).unwrap();
        reactor.schedule(1, 7);

        let start = std::time::Instant::now();
        let mut ready = Vec::new();
        reactor.poll(&mut ready).unwrap();

        assert!(ready.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
