/// Per-connection rate controller.
///
/// The ideal schedule puts send `n` at `thread_start + n / throughput`. When
/// the target falls behind, an accelerated schedule at twice the nominal rate
/// catches up without producing unbounded bursts.
#[derive(Debug, Clone)]
pub struct Pacer {
    /// Nominal throughput in requests per microsecond.
    throughput: f64,
    catch_up_throughput: f64,
    /// First-connect timestamp; the origin of the ideal schedule. Not reset
    /// on reconnect.
    pub thread_start: u64,
    /// Responses completed on this connection. Never decremented.
    pub complete: u64,
    caught_up: bool,
    catch_up_start_time: u64,
    complete_at_catch_up_start: u64,
    // Tracking numbers, kept purely for the negative-latency diagnostics.
    pub latest_should_send_time: u64,
    pub latest_expected_start: u64,
}

impl Pacer {
    pub fn new(throughput: f64) -> Self {
        Self {
            throughput,
            catch_up_throughput: throughput * 2.0,
            thread_start: 0,
            complete: 0,
            caught_up: true,
            catch_up_start_time: 0,
            complete_at_catch_up_start: 0,
            latest_should_send_time: 0,
            latest_expected_start: 0,
        }
    }

    #[inline]
    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    /// The ideal-schedule start time for the response numbered `complete`.
    #[inline]
    pub fn expected_start(&self, complete: u64) -> u64 {
        self.thread_start + (complete as f64 / self.throughput) as u64
    }

    /// Returns 0 when a send is permitted now, otherwise the delay in
    /// microseconds until the next permitted send.
    pub fn usec_to_next_send(&mut self, now: u64) -> u64 {
        let mut next_start_time = self.expected_start(self.complete);
        let mut send_now = true;

        if next_start_time > now {
            // On pace.
            self.caught_up = true;
            send_now = false;
        } else {
            if self.caught_up {
                // First fall-behind since we were last caught up.
                self.caught_up = false;
                self.catch_up_start_time = now;
                self.complete_at_catch_up_start = self.complete;
            }

            let complete_since_catch_up_start = self.complete - self.complete_at_catch_up_start;
            next_start_time = self.catch_up_start_time
                + (complete_since_catch_up_start as f64 / self.catch_up_throughput) as u64;

            if next_start_time > now {
                // Not yet time to send, even at catch-up throughput.
                send_now = false;
            }
        }

        if send_now {
            self.latest_should_send_time = now;
            self.latest_expected_start = next_start_time;
            0
        } else {
            next_start_time - now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1000 req/s.
    const THROUGHPUT: f64 = 0.001;

    #[test]
    fn first_send_is_immediate() {
        let mut pacer = Pacer::new(THROUGHPUT);
        assert_eq!(pacer.usec_to_next_send(0), 0);
    }

    #[test]
    fn paces_to_the_ideal_schedule() {
        let mut pacer = Pacer::new(THROUGHPUT);
        pacer.complete = 1;

        // Send 1 is due at t=1000; at t=500 that is 500us away.
        assert_eq!(pacer.usec_to_next_send(500), 500);
    }

    #[test]
    fn falls_behind_into_catch_up() {
        let mut pacer = Pacer::new(THROUGHPUT);
        pacer.complete = 1;

        // Send 1 was due at t=1000; at t=2000 we are behind and may send.
        assert_eq!(pacer.usec_to_next_send(2000), 0);
        assert!(!pacer.caught_up);
        assert_eq!(pacer.catch_up_start_time, 2000);
        assert_eq!(pacer.complete_at_catch_up_start, 1);

        // The next send while behind is paced at 2x throughput: 500us.
        pacer.complete = 2;
        assert_eq!(pacer.usec_to_next_send(2000), 500);
    }

    #[test]
    fn recovers_once_back_on_pace() {
        let mut pacer = Pacer::new(THROUGHPUT);
        pacer.complete = 1;
        assert_eq!(pacer.usec_to_next_send(2000), 0);

        // With enough completions banked, the ideal schedule is ahead of the
        // clock again and the caught-up substate returns.
        pacer.complete = 10;
        assert!(pacer.usec_to_next_send(3000) > 0);
        assert!(pacer.caught_up);
    }

    #[test]
    fn send_now_is_idempotent() {
        let mut pacer = Pacer::new(THROUGHPUT);
        pacer.complete = 1;

        assert_eq!(pacer.usec_to_next_send(2000), 0);
        assert_eq!(pacer.usec_to_next_send(2000), 0);
    }

    #[test]
    fn delay_is_non_increasing_in_now() {
        let mut pacer = Pacer::new(THROUGHPUT);
        pacer.complete = 5;

        let mut prev = u64::MAX;
        for now in (0..5000).step_by(250) {
            let delay = pacer.usec_to_next_send(now);
            assert!(delay <= prev, "delay grew from {prev} to {delay} at t={now}");
            prev = delay;
        }
    }

    #[test]
    fn expected_start_uses_batch_start_count() {
        let pacer = {
            let mut p = Pacer::new(THROUGHPUT);
            p.complete = 7;
            p
        };

        // Expected start is dated from the completion count at batch start,
        // not the running count.
        assert_eq!(pacer.expected_start(4), 4000);
        assert_eq!(pacer.expected_start(7), 7000);
    }
}
