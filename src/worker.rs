use std::{
    io, mem,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};

use bytes::Bytes;
use hdrhistogram::Histogram;
use mio::Interest;
use rustls::pki_types::ServerName;

use crate::{
    cfg::{Config, LocalAddr},
    connection::{Connection, RECVBUF},
    engine::Shared,
    http::Completed,
    net::{self, Sock, Status, Want},
    reactor::{Reactor, Ready},
    script::Script,
    stats::Errors,
    time_us, MAX_LATENCY_US,
};

const CALIBRATE_DELAY_MS: u64 = 10_000;
const STOP_CHECK_INTERVAL_MS: u64 = 2_000;
const THREAD_SYNC_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Warmup,
    Normal,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    /// Staggered initial connect of one slot.
    Connect(usize),
    /// Pacer delay before the next batch on one slot.
    Delay(usize),
    CheckStop,
    WarmupTimeout,
    ThreadSync,
    Calibrate,
    SampleRate,
}

enum Flow {
    Continue,
    /// The connection was replaced or the reactor stopped; remaining
    /// already-buffered responses belong to the old socket and are dropped.
    Break,
}

enum ReadStep {
    Progress { short: bool },
    Blocked,
    Eof,
    SockErr,
    ParseErr,
}

pub(crate) struct WorkerParams {
    pub id: usize,
    pub cfg: Arc<Config>,
    pub shared: Arc<Shared>,
    pub addr: SocketAddr,
    pub script: Box<dyn Script>,
    /// Shared static request blob; unused when `dynamic`.
    pub request: Bytes,
    pub pipeline: u64,
    pub dynamic: bool,
    pub want_response: bool,
    /// Connections owned by this worker.
    pub connections: u64,
    /// Requests/sec this worker is responsible for.
    pub throughput: f64,
    pub local_ip: Option<LocalAddr>,
    pub server_name: Option<ServerName<'static>>,
    pub stop_at: u64,
}

/// Everything a worker hands back to the coordinator at join.
pub(crate) struct WorkerOutput {
    pub complete: u64,
    pub bytes: u64,
    pub errors: Errors,
    pub latency: Histogram<u64>,
    pub u_latency: Histogram<u64>,
    pub phase_normal_start: u64,
}

/// One load-generating thread: a reactor, a set of paced connections and two
/// latency histograms. All state is thread-local; the only shared touchpoints
/// are the stop flag, the warmup barrier and the throughput samples.
pub(crate) struct Worker {
    id: usize,
    cfg: Arc<Config>,
    shared: Arc<Shared>,
    addr: SocketAddr,
    reactor: Reactor<Timer>,
    connections: Vec<Connection>,
    script: Box<dyn Script>,
    pipeline: u64,
    dynamic: bool,
    want_response: bool,
    local_ip: Option<LocalAddr>,
    server_name: Option<ServerName<'static>>,
    phase: Phase,
    phase_normal_start: u64,
    start: u64,
    stop_at: u64,
    interval_ms: u64,
    complete: u64,
    /// Requests completed in the current sampling interval.
    requests: u64,
    bytes: u64,
    errors: Errors,
    latency: Histogram<u64>,
    u_latency: Histogram<u64>,
    completed: Vec<Completed>,
}

impl Worker {
    pub fn new(params: WorkerParams) -> io::Result<Self> {
        let capacity = 10 + params.cfg.connections as usize * 3;
        let reactor = Reactor::with_capacity(capacity)?;

        let throughput = (params.throughput / 1_000_000.0) / params.connections as f64;
        let mut connections = Vec::with_capacity(params.connections as usize);
        for _ in 0..params.connections {
            connections.push(Connection::new(
                params.request.clone(),
                throughput,
                params.want_response,
            ));
        }

        let phase = if params.cfg.warmup {
            Phase::Warmup
        } else {
            Phase::Normal
        };

        let m = Self {
            id: params.id,
            cfg: params.cfg,
            shared: params.shared,
            addr: params.addr,
            reactor,
            connections,
            script: params.script,
            pipeline: params.pipeline,
            dynamic: params.dynamic,
            want_response: params.want_response,
            local_ip: params.local_ip,
            server_name: params.server_name,
            phase,
            phase_normal_start: 0,
            start: 0,
            stop_at: params.stop_at,
            interval_ms: 0,
            complete: 0,
            requests: 0,
            bytes: 0,
            errors: Errors::default(),
            latency: new_histogram(),
            u_latency: new_histogram(),
            completed: Vec::new(),
        };

        Ok(m)
    }

    pub fn run(mut self) -> WorkerOutput {
        // Stagger connects 5 msec apart within the thread.
        for i in 0..self.connections.len() {
            self.reactor.schedule(i as u64 * 5, Timer::Connect(i));
        }
        self.reactor.schedule(STOP_CHECK_INTERVAL_MS, Timer::CheckStop);

        if self.cfg.warmup {
            let timeout = self
                .cfg
                .warmup_timeout
                .map(|d| d.as_millis() as u64)
                // Scale the default with the handshake load: 600sec per 350K
                // connections, but no shorter than the timer resolution
                // comfortably allows.
                .unwrap_or_else(|| (self.cfg.connections * 600_000 / 350_000).max(1000));
            self.reactor.schedule(timeout, Timer::WarmupTimeout);
        } else {
            self.reactor.schedule(CALIBRATE_DELAY_MS, Timer::Calibrate);
        }

        self.start = time_us();

        let mut ready: Vec<Ready> = Vec::new();
        let mut due: Vec<Timer> = Vec::new();

        while !self.reactor.stopped() {
            if let Err(e) = self.reactor.poll(&mut ready) {
                log::error!("reactor poll failed: {e}");
                break;
            }
            for ev in ready.iter().copied() {
                self.on_ready(ev);
                if self.reactor.stopped() {
                    break;
                }
            }
            self.reactor.expired(&mut due);
            for timer in due.iter().copied() {
                if let Some(next_ms) = self.on_timer(timer) {
                    self.reactor.schedule(next_ms, timer);
                }
            }
        }

        self.close_all();

        WorkerOutput {
            complete: self.complete,
            bytes: self.bytes,
            errors: self.errors,
            latency: self.latency,
            u_latency: self.u_latency,
            phase_normal_start: self.phase_normal_start,
        }
    }

    fn on_ready(&mut self, ev: Ready) {
        let idx = ev.token.0;
        if idx >= self.connections.len() || self.connections[idx].sock.is_none() {
            return;
        }

        if !self.connections[idx].is_connected {
            self.socket_connected(idx);
            return;
        }

        if ev.readable {
            self.socket_readable(idx);
        }
        if self.reactor.stopped() {
            return;
        }
        if ev.writable
            && self.connections[idx].sock.is_some()
            && self.connections[idx].is_connected
        {
            self.socket_writeable(idx);
        }
    }

    fn on_timer(&mut self, timer: Timer) -> Option<u64> {
        match timer {
            Timer::Connect(idx) => {
                self.connections[idx].pacer.thread_start = time_us();
                self.connect_slot(idx);
                None
            }
            Timer::Delay(idx) => {
                let conn = &mut self.connections[idx];
                if conn.sock.is_none() || !conn.is_connected {
                    return None;
                }
                let delay = conn.pacer.usec_to_next_send(time_us());
                if delay > 0 {
                    return Some(delay_to_ms(delay));
                }
                self.add_interest(idx, Interest::WRITABLE);
                None
            }
            Timer::CheckStop => {
                if self.shared.stop.load(Ordering::SeqCst) || time_us() >= self.stop_at {
                    self.close_all();
                    self.reactor.stop();
                }
                Some(STOP_CHECK_INTERVAL_MS)
            }
            Timer::WarmupTimeout => {
                // Safe when already in the normal phase; the move is a no-op.
                self.phase_move(Phase::Normal);
                None
            }
            Timer::ThreadSync => {
                if self.shared.all_ready.load(Ordering::SeqCst) {
                    self.phase_move(Phase::Normal);
                }
                match self.phase {
                    Phase::Normal => None,
                    Phase::Warmup => Some(THREAD_SYNC_INTERVAL_MS),
                }
            }
            Timer::Calibrate => self.calibrate(),
            Timer::SampleRate => self.sample_rate(),
        }
    }

    /// Warmup ends for this worker: install file events on every connected
    /// socket and arm the calibration timer.
    fn phase_move(&mut self, to: Phase) {
        if self.phase == Phase::Warmup && to == Phase::Normal {
            log::info!(
                "warmup phase ended (thread={}, duration={}sec)",
                self.id,
                (time_us() - self.start) / 1_000_000
            );

            for idx in 0..self.connections.len() {
                if self.connections[idx].is_connected {
                    self.set_interest(idx, Some(Interest::READABLE | Interest::WRITABLE));
                }
            }
            self.reactor.schedule(CALIBRATE_DELAY_MS, Timer::Calibrate);
            self.start = time_us();
            self.phase_normal_start = self.start;
        }

        self.phase = to;
    }

    fn calibrate(&mut self) -> Option<u64> {
        if self.latency.is_empty() {
            return Some(CALIBRATE_DELAY_MS);
        }

        let mean = self.latency.mean();
        let p90_ms = self.latency.value_at_quantile(0.90) as f64 / 1000.0;
        let interval = ((p90_ms * 2.0).max(10.0)) as u64;

        self.latency.reset();
        self.u_latency.reset();
        self.start = time_us();
        self.interval_ms = interval;
        self.requests = 0;

        log::debug!(
            "thread {} calibration: mean lat.: {:.3}ms, rate sampling interval: {}ms",
            self.id,
            mean / 1000.0,
            interval
        );

        self.reactor.schedule(interval, Timer::SampleRate);
        None
    }

    fn sample_rate(&mut self) -> Option<u64> {
        let elapsed_ms = ((time_us() - self.start) / 1000).max(1);
        let rate = (self.requests as f64 / elapsed_ms as f64 * 1000.0) as u64;

        self.shared
            .requests
            .lock()
            .expect("throughput stats lock")
            .record(rate);

        self.requests = 0;
        self.start = time_us();

        Some(self.interval_ms)
    }

    fn connect_slot(&mut self, idx: usize) {
        self.connections[idx].is_connected = false;

        let stream = match net::connect_stream(self.addr, self.local_ip.as_ref()) {
            Ok(stream) => stream,
            Err(e) => {
                log::debug!("connect to {} failed: {e}", self.addr);
                self.errors.connect += 1;
                self.connections[idx].sock = None;
                self.connections[idx].interest = None;
                return;
            }
        };

        let sock = match (&self.cfg.tls, &self.server_name) {
            (Some(tls), Some(name)) => {
                match rustls::ClientConnection::new(tls.clone(), name.clone()) {
                    Ok(session) => Sock::tls(stream, session),
                    Err(e) => {
                        log::error!("unable to create TLS session: {e}");
                        self.errors.connect += 1;
                        return;
                    }
                }
            }
            _ => Sock::plain(stream),
        };

        let conn = &mut self.connections[idx];
        conn.sock = Some(sock);
        conn.interest = None;
        conn.latest_connect = time_us();
        self.set_interest(idx, Some(Interest::READABLE | Interest::WRITABLE));
    }

    fn reconnect(&mut self, idx: usize) {
        self.set_interest(idx, None);
        self.connections[idx].sock = None;
        self.errors.reconnect += 1;
        self.connect_slot(idx);
    }

    fn socket_connected(&mut self, idx: usize) {
        let status = {
            let conn = &mut self.connections[idx];
            let Some(sock) = conn.sock.as_mut() else { return };
            sock.connect()
        };

        match status {
            Status::Error => {
                self.errors.connect += 1;
                self.reconnect(idx);
                return;
            }
            Status::Retry(want) => {
                // Keep only the registrations the TLS engine asked for;
                // polling both directions during the handshake spins the CPU.
                self.set_interest(idx, interest_of(want));
                return;
            }
            Status::Ok(_) => {}
        }

        if self.connections[idx].is_connected {
            return;
        }

        {
            let conn = &mut self.connections[idx];
            conn.parser.reset();
            conn.rx.clear();
            conn.written = 0;
            conn.is_connected = true;
        }
        self.errors.established += 1;

        // File events are installed here only in the normal phase; for
        // warmed-up sockets they are installed at the phase transition.
        // The registration is re-armed even if unchanged: the readiness
        // edge that completed the connect is already consumed.
        match self.phase {
            Phase::Normal => self.rearm_interest(idx, Interest::READABLE | Interest::WRITABLE),
            Phase::Warmup => self.set_interest(idx, None),
        }

        if self.cfg.warmup && self.errors.established == self.connections.len() as u64 {
            // All local handshakes are done: publish readiness and start
            // polling for the other threads to catch up.
            self.reactor
                .schedule(THREAD_SYNC_INTERVAL_MS, Timer::ThreadSync);
            let counter = self.shared.ready_workers.fetch_add(1, Ordering::SeqCst) + 1;
            if counter == self.cfg.threads as usize {
                self.shared.all_ready.store(true, Ordering::SeqCst);
            }
        }
    }

    fn socket_writeable(&mut self, idx: usize) {
        let now = time_us();

        let delay = {
            let conn = &mut self.connections[idx];
            if conn.written == 0 {
                conn.pacer.usec_to_next_send(now)
            } else {
                0
            }
        };
        if delay > 0 {
            // Not yet time to send. Delay.
            self.remove_interest(idx, Interest::WRITABLE);
            self.reactor.schedule(delay_to_ms(delay), Timer::Delay(idx));
            return;
        }

        let request = if self.dynamic && self.connections[idx].written == 0 {
            Some(self.script.request())
        } else {
            None
        };

        enum Outcome {
            Done,
            Partial,
            Retry,
            Err,
        }

        let outcome = {
            let conn = &mut self.connections[idx];
            if conn.written == 0 {
                conn.latest_write = now;
                if let Some(request) = request {
                    conn.request = request;
                }
                if !conn.has_pending {
                    conn.actual_latency_start = now;
                    conn.complete_at_last_batch_start = conn.pacer.complete;
                    conn.has_pending = true;
                }
                conn.pending = self.pipeline;
            }

            let Connection {
                sock,
                request,
                written,
                ..
            } = conn;
            let Some(sock) = sock.as_mut() else { return };

            match sock.write(&request[*written..]) {
                Status::Ok(n) => {
                    *written += n;
                    if *written == request.len() {
                        *written = 0;
                        Outcome::Done
                    } else {
                        Outcome::Partial
                    }
                }
                Status::Retry(_) => Outcome::Retry,
                Status::Error => Outcome::Err,
            }
        };

        match outcome {
            Outcome::Done => self.remove_interest(idx, Interest::WRITABLE),
            // Partial write or engine retry: the registration stays as is.
            Outcome::Partial | Outcome::Retry => {}
            Outcome::Err => {
                self.errors.write += 1;
                self.reconnect(idx);
            }
        }
    }

    fn socket_readable(&mut self, idx: usize) {
        loop {
            let step = self.read_step(idx);

            let completed = mem::take(&mut self.completed);
            for resp in completed {
                match self.response_complete(idx, resp) {
                    Flow::Continue => {}
                    Flow::Break => return,
                }
            }

            match step {
                ReadStep::Progress { short } => {
                    if short {
                        return;
                    }
                    let more = match self.connections[idx].sock.as_mut() {
                        Some(sock) => sock.readable(),
                        None => return,
                    };
                    if more == 0 {
                        return;
                    }
                }
                ReadStep::Blocked => return,
                ReadStep::Eof => {
                    self.reconnect(idx);
                    return;
                }
                ReadStep::SockErr | ReadStep::ParseErr => {
                    self.errors.read += 1;
                    self.reconnect(idx);
                    return;
                }
            }
        }
    }

    /// One read into the receive buffer plus one parser pass. Completed
    /// responses land in `self.completed`.
    fn read_step(&mut self, idx: usize) -> ReadStep {
        let conn = &mut self.connections[idx];
        let Connection {
            sock,
            recv,
            rx,
            parser,
            ..
        } = conn;
        let Some(sock) = sock.as_mut() else {
            return ReadStep::Blocked;
        };

        let n = match sock.read(&mut recv[..]) {
            Status::Ok(0) => {
                return match parser.finish(rx, &mut self.completed) {
                    Ok(()) => ReadStep::Eof,
                    Err(_) => ReadStep::ParseErr,
                };
            }
            Status::Ok(n) => n,
            Status::Retry(_) => return ReadStep::Blocked,
            Status::Error => return ReadStep::SockErr,
        };

        rx.extend_from_slice(&recv[..n]);
        if parser.advance(rx, &mut self.completed).is_err() {
            return ReadStep::ParseErr;
        }

        self.bytes += n as u64;
        ReadStep::Progress { short: n < RECVBUF }
    }

    fn response_complete(&mut self, idx: usize, resp: Completed) -> Flow {
        let now = time_us();

        self.complete += 1;
        self.requests += 1;

        if resp.status > 399 {
            self.errors.status += 1;
        }

        if self.want_response {
            self.script.response(resp.status, &resp.headers, &resp.body);
        }

        if now >= self.stop_at {
            self.reactor.stop();
            return Flow::Break;
        }

        let (expected_timing, actual_timing, batch_done) = {
            let conn = &mut self.connections[idx];

            // Count all responses, including pipelined ones.
            conn.pacer.complete += 1;

            let expected_latency_start =
                conn.pacer.expected_start(conn.complete_at_last_batch_start);
            let expected_timing = now as i64 - expected_latency_start as i64;

            if expected_timing < 0 {
                // The pacing math guarantees this never happens; if it does,
                // dump everything that could explain it and keep going.
                log::error!(
                    "negative corrected latency, pacing state dump: \
                     expected_latency_timing={expected_timing} now={now} \
                     expected_latency_start={expected_latency_start} \
                     thread_start={} complete={} throughput={} \
                     latest_should_send_time={} latest_expected_start={} \
                     latest_connect={} latest_write={}",
                    conn.pacer.thread_start,
                    conn.pacer.complete,
                    conn.pacer.throughput(),
                    conn.pacer.latest_should_send_time,
                    conn.pacer.latest_expected_start,
                    conn.latest_connect,
                    conn.latest_write,
                );
            }

            conn.pacer.latest_should_send_time = 0;
            conn.pacer.latest_expected_start = 0;

            conn.pending = conn.pending.saturating_sub(1);
            let batch_done = conn.pending == 0;
            if batch_done {
                conn.has_pending = false;
            }

            let actual_timing = now.saturating_sub(conn.actual_latency_start);
            (expected_timing, actual_timing, batch_done)
        };

        if batch_done {
            self.add_interest(idx, Interest::WRITABLE);
        }

        // Record either the last response of the batch or all of them,
        // depending on configuration.
        if self.cfg.record_all_responses || batch_done {
            if expected_timing >= 0 {
                self.latency.saturating_record(expected_timing as u64);
            }
            self.u_latency.saturating_record(actual_timing);
        }

        if !resp.keep_alive {
            self.reconnect(idx);
            return Flow::Break;
        }

        Flow::Continue
    }

    fn close_all(&mut self) {
        for idx in 0..self.connections.len() {
            self.set_interest(idx, None);
            let conn = &mut self.connections[idx];
            conn.sock = None;
            conn.is_connected = false;
        }
    }

    fn set_interest(&mut self, idx: usize, want: Option<Interest>) {
        let conn = &mut self.connections[idx];
        let Some(sock) = conn.sock.as_mut() else {
            conn.interest = None;
            return;
        };
        let token = mio::Token(idx);

        let result = match (conn.interest, want) {
            (None, Some(interest)) => self.reactor.register(sock.stream_mut(), token, interest),
            (Some(current), Some(interest)) if current != interest => {
                self.reactor.reregister(sock.stream_mut(), token, interest)
            }
            (Some(_), None) => self.reactor.deregister(sock.stream_mut()),
            _ => Ok(()),
        };

        if let Err(e) = result {
            log::error!("event registration failed for slot {idx}: {e}");
        }
        conn.interest = want;
    }

    /// Like `set_interest`, but re-registers even when the interest set is
    /// unchanged, re-arming the edge for a socket that is already ready.
    fn rearm_interest(&mut self, idx: usize, interest: Interest) {
        let conn = &mut self.connections[idx];
        let Some(sock) = conn.sock.as_mut() else {
            conn.interest = None;
            return;
        };
        let token = mio::Token(idx);

        let result = match conn.interest {
            Some(_) => self.reactor.reregister(sock.stream_mut(), token, interest),
            None => self.reactor.register(sock.stream_mut(), token, interest),
        };

        if let Err(e) = result {
            log::error!("event registration failed for slot {idx}: {e}");
        }
        conn.interest = Some(interest);
    }

    fn add_interest(&mut self, idx: usize, interest: Interest) {
        let combined = match self.connections[idx].interest {
            Some(current) => current | interest,
            None => interest,
        };
        self.set_interest(idx, Some(combined));
    }

    fn remove_interest(&mut self, idx: usize, interest: Interest) {
        let remaining = self.connections[idx]
            .interest
            .and_then(|current| current.remove(interest));
        self.set_interest(idx, remaining);
    }
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_LATENCY_US, 3).expect("histogram bounds are valid")
}

fn interest_of(want: Want) -> Option<Interest> {
    match (want.read, want.write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn delay_to_ms(delay_us: u64) -> u64 {
    ((delay_us as f64) / 1000.0 + 0.5).round() as u64
}
