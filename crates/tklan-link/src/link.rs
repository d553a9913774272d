//! Serial link state machine.
//!
//! [`SerialLink`] owns the single serial device and everything needed to
//! coordinate access to it: the port mutex, the master flag, the hand-over
//! request flags and the supervisor thread that reopens the port after a
//! loss.
//!
//! ```text
//! Closed ──start()──> Opening ──ok──> Open{Slave | Master}
//!    ^                   ^                  │
//!    │                   └───supervisor──── │ port error
//!    └────────────stop()────────────────────┘
//! ```
//!
//! While `Open`, exactly one of master/slave is in effect: `check_master`
//! observes the line (an idle line means nobody holds the token, so we do),
//! token accept promotes a slave, token offer demotes the master.
//!
//! Every blocking operation on the port happens under the port mutex:
//! [`SerialLink::send_frame`], [`SerialLink::listen`] and the master check
//! never interleave. The token-accept sub-protocol runs inside the
//! listener's mutex acquisition so no other writer can inject between the
//! observed offer and our acceptance.

use std::{
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rand::Rng;
use tklan_proto::{Frame, Function, codec};
use tracing::{debug, error, info, trace, warn};

use crate::{
    HOST_ADDRESS,
    config::LinkConfig,
    error::{LinkError, Result},
    flags::DeadlineFlag,
    port::{BusPort, PortFactory},
};

type PortSlot = Option<Box<dyn BusPort>>;

/// Host-side end of the TKLan bus.
///
/// Not `Clone`; wrap it in an [`Arc`] to share between the node layer,
/// the gateway worker and the supervisor.
pub struct SerialLink {
    core: Arc<LinkCore>,
    supervisor: Mutex<Option<thread::JoinHandle<()>>>,
}

struct LinkCore {
    config: LinkConfig,
    factory: Box<dyn PortFactory>,
    port: Mutex<PortSlot>,
    im_master: AtomicBool,
    stop: AtomicBool,
    want_master: DeadlineFlag<()>,
    give_master: DeadlineFlag<u8>,
}

impl SerialLink {
    /// Build a link over the given port factory. No I/O happens until
    /// [`SerialLink::start`].
    #[must_use]
    pub fn new(config: LinkConfig, factory: impl PortFactory + 'static) -> Self {
        let timeout = config.master_event_timeout;
        Self {
            core: Arc::new(LinkCore {
                config,
                factory: Box::new(factory),
                port: Mutex::new(None),
                im_master: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                want_master: DeadlineFlag::new(timeout),
                give_master: DeadlineFlag::new(timeout),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Open the port, run the initial master check and spawn the
    /// supervisor.
    ///
    /// # Errors
    ///
    /// `LinkError::SerialConfig` when the initial open fails; later losses
    /// are handled by the supervisor instead.
    pub fn start(&self) -> Result<()> {
        let mut supervisor = lock(&self.supervisor);
        if supervisor.is_some() {
            return Ok(());
        }

        let port = self.core.factory.open(&self.core.config)?;
        {
            let mut slot = self.core.lock_port();
            *slot = Some(port);
            self.core.check_master_locked(&mut slot)?;
        }

        self.core.stop.store(false, Ordering::SeqCst);
        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("tklan-supervisor".to_string())
            .spawn(move || supervise(&core))
            .map_err(|e| LinkError::SerialConfig { message: e.to_string() })?;
        *supervisor = Some(handle);

        info!(port = %self.core.config.serial_port, "serial link started");
        Ok(())
    }

    /// Signal the supervisor, join it and close the port.
    pub fn stop(&self) {
        self.core.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.supervisor).take() {
            if handle.join().is_err() {
                error!("supervisor thread terminated abnormally");
            }
        }
        *self.core.lock_port() = None;
        info!("serial link stopped");
    }

    /// Whether this host currently holds the token.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.core.im_master.load(Ordering::SeqCst)
    }

    /// Whether the port is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.lock_port().is_some()
    }

    /// The configuration the link was built with.
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.core.config
    }

    /// Ask the listener to accept the next token offer. Expires after the
    /// configured master-event timeout.
    pub fn request_master(&self) {
        self.core.want_master.set(());
    }

    /// Whether a (non-expired) master request is pending.
    #[must_use]
    pub fn wants_master(&self) -> bool {
        self.core.want_master.is_set()
    }

    /// Ask for the token to be offered to `node` at the next opportunity.
    /// Expires after the configured master-event timeout.
    pub fn offer_master(&self, node: u8) {
        self.core.give_master.set(node);
    }

    /// Consume a pending (non-expired) give-master request.
    #[must_use]
    pub fn take_give_master(&self) -> Option<u8> {
        self.core.give_master.take()
    }

    /// Execute one request/reply transaction as master.
    ///
    /// Under the port mutex: flush input, write the frame, consume the
    /// transceiver echo, read exactly [`Frame::response_size`] reply bytes.
    /// Transient failures (line noise) retry up to the configured budget.
    ///
    /// # Errors
    ///
    /// - `LinkError::NoMaster` when this host does not hold the token
    /// - `LinkError::Read` when the echo is short or mangled
    /// - `LinkError::Write` when the peer acknowledged (echo fine) but the
    ///   reply is absent or malformed
    pub fn send_frame(&self, frame: &Frame) -> Result<Frame> {
        if !self.is_master() {
            return Err(LinkError::NoMaster);
        }

        let mut slot = self.core.lock_port();
        let mut attempt = 0;
        loop {
            match self.core.transact(&mut slot, frame) {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt + 1 < self.core.config.send_frame_tries => {
                    attempt += 1;
                    warn!(destination = frame.destination(), error = %e, attempt, "retrying transaction");
                }
                Err(e) => {
                    debug!(destination = frame.destination(), error = %e, "transaction failed");
                    return Err(e);
                }
            }
        }
    }

    /// Observe the line to decide who is master.
    ///
    /// Flushes the input, then reads until one byte arrives or the
    /// wait-master period elapses. An idle line means nobody holds the
    /// token, so this host is master.
    pub fn check_master(&self) -> Result<bool> {
        let mut slot = self.core.lock_port();
        self.core.check_master_locked(&mut slot)
    }

    /// Receive frames while in slave mode.
    ///
    /// The returned iterator holds the port mutex for its whole life, so
    /// the token-accept sub-protocol it runs cannot be interleaved with
    /// another writer. Iteration ends at [`SerialLink::stop`] or after
    /// yielding a terminal error (`NoSlave`, port loss).
    #[must_use]
    pub fn listen(&self) -> Listener<'_> {
        Listener { core: &self.core, slot: self.core.lock_port(), buffer: Vec::new(), done: false }
    }

    /// Offer the token to `destination` and verify it moved.
    ///
    /// # Errors
    ///
    /// - `LinkError::NoMaster` when we do not hold the token
    /// - `LinkError::Token` when the line shows us still master afterwards
    pub fn offer_token(&self, destination: u8) -> Result<()> {
        if !self.is_master() {
            return Err(LinkError::NoMaster);
        }

        let mut slot = self.core.lock_port();
        let frame = Frame::request(HOST_ADDRESS, destination, Function::Token, Bytes::new())?;
        self.core.token_exchange(&mut slot, &frame)?;

        if self.core.check_master_locked(&mut slot)? {
            warn!(destination, "token offer did not transfer mastership");
            return Err(LinkError::Token { destination });
        }
        self.core.give_master.clear();
        info!(destination, "token handed over");
        Ok(())
    }
}

impl LinkCore {
    fn lock_port(&self) -> MutexGuard<'_, PortSlot> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One transaction attempt. Port-level errors close the port; the
    /// supervisor reopens it.
    fn transact(&self, slot: &mut PortSlot, frame: &Frame) -> Result<Frame> {
        let port = slot.as_mut().ok_or(LinkError::Read)?;

        if port.clear_input().is_err() {
            *slot = None;
            return Err(LinkError::Read);
        }
        trace!(frame = %frame, "writing frame");
        if port.write_all(frame.as_bytes()).is_err() {
            *slot = None;
            return Err(LinkError::Write);
        }

        let mut echo = vec![0u8; frame.as_bytes().len()];
        match read_exact(port.as_mut(), &mut echo) {
            Ok(got) if got == echo.len() => {}
            Ok(_) => return Err(LinkError::Read),
            Err(_) => {
                *slot = None;
                return Err(LinkError::Read);
            }
        }
        if echo != frame.as_bytes() {
            debug!(frame = %frame, "echo does not match the transmitted frame");
            return Err(LinkError::Read);
        }

        // Read up to the oracle's promise. Nodes running old software answer
        // shorter identify records; whatever arrived must still checksum.
        let mut reply = vec![0u8; frame.response_size()];
        let got = match read_exact(port.as_mut(), &mut reply) {
            Ok(got) => got,
            Err(_) => {
                *slot = None;
                return Err(LinkError::Write);
            }
        };
        reply.truncate(got);
        let reply = Frame::parse(reply).map_err(|e| {
            debug!(error = %e, "reply failed to parse");
            LinkError::Write
        })?;
        trace!(reply = %reply, "reply received");
        Ok(reply)
    }

    /// Master check with the port mutex already held.
    fn check_master_locked(&self, slot: &mut PortSlot) -> Result<bool> {
        let port = slot.as_mut().ok_or(LinkError::Read)?;
        if port.clear_input().is_err() {
            *slot = None;
            return Err(LinkError::Read);
        }

        let deadline = Instant::now() + self.config.wait_master_period;
        let mut byte = [0u8; 1];
        let mut heard = false;
        while Instant::now() < deadline {
            match port.read(&mut byte) {
                Ok(0) => {}
                Ok(_) => {
                    heard = true;
                    break;
                }
                Err(_) => {
                    *slot = None;
                    return Err(LinkError::Read);
                }
            }
        }

        let master = !heard;
        self.im_master.store(master, Ordering::SeqCst);
        debug!(im_master = master, "master check");
        Ok(master)
    }

    /// Write a token frame and consume its echo and three-byte reply.
    ///
    /// The reply is read best-effort: a silent peer shows up in the master
    /// check that always follows, not here.
    fn token_exchange(&self, slot: &mut PortSlot, frame: &Frame) -> Result<()> {
        let port = slot.as_mut().ok_or(LinkError::Read)?;
        if port.clear_input().is_err() {
            *slot = None;
            return Err(LinkError::Read);
        }
        if port.write_all(frame.as_bytes()).is_err() {
            *slot = None;
            return Err(LinkError::Write);
        }

        let mut echo = vec![0u8; frame.as_bytes().len()];
        match read_exact(port.as_mut(), &mut echo) {
            Ok(got) if got == echo.len() && echo == frame.as_bytes() => {}
            Ok(_) => return Err(LinkError::Read),
            Err(_) => {
                *slot = None;
                return Err(LinkError::Read);
            }
        }

        let mut reply = [0u8; 3];
        if read_exact(port.as_mut(), &mut reply).is_err() {
            *slot = None;
            return Err(LinkError::Read);
        }
        Ok(())
    }
}

/// Iterator over frames received in slave mode.
///
/// Holds the port mutex from construction to drop.
pub struct Listener<'a> {
    core: &'a LinkCore,
    slot: MutexGuard<'a, PortSlot>,
    buffer: Vec<u8>,
    done: bool,
}

impl Listener<'_> {
    /// Read once into the buffer. `Ok(false)` means the timeout elapsed
    /// with nothing new.
    fn top_up(&mut self, want: usize) -> Result<bool> {
        let port = self.slot.as_mut().ok_or(LinkError::Read)?;
        let mut chunk = vec![0u8; want.max(1)];
        match port.read(&mut chunk) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(_) => {
                *self.slot = None;
                Err(LinkError::Read)
            }
        }
    }

    /// Idle line seen: re-run the master check. Returns `true` when the
    /// listener should terminate with `NoSlave`.
    fn handle_idle(&mut self) -> Result<bool> {
        self.buffer.clear();
        let master = self.core.check_master_locked(&mut self.slot)?;
        Ok(master && !self.core.want_master.is_set())
    }

    /// Answer a token offer from `offerer`, then re-check the line.
    fn accept_token(&mut self, offerer: u8) -> Result<()> {
        info!(offerer, "accepting token offer");
        let accept = Frame::request(HOST_ADDRESS, offerer, Function::Token, Bytes::new())?;
        self.core.token_exchange(&mut self.slot, &accept)?;
        if self.core.check_master_locked(&mut self.slot)? {
            self.core.want_master.clear();
            info!(offerer, "token accepted; this host is master");
        }
        Ok(())
    }
}

impl Iterator for Listener<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.core.stop.load(Ordering::SeqCst) {
                self.done = true;
                return None;
            }

            // Header and control first.
            if self.buffer.len() < 2 {
                match self.top_up(3) {
                    Ok(true) => continue,
                    Ok(false) => match self.handle_idle() {
                        Ok(true) => {
                            self.done = true;
                            return Some(Err(LinkError::NoSlave));
                        }
                        Ok(false) => continue,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    },
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            // Control byte tells us the frame size.
            let Ok((_, length)) = codec::decode_ctrl(&self.buffer[1..2]) else {
                self.buffer.remove(0);
                continue;
            };
            let total = length as usize + 3;
            if self.buffer.len() < total {
                match self.top_up(total - self.buffer.len()) {
                    Ok(true) => continue,
                    // Stalled mid-frame: resynchronise like any corrupt
                    // chain, sliding one byte.
                    Ok(false) => {
                        self.buffer.remove(0);
                        continue;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            match Frame::parse(Bytes::copy_from_slice(&self.buffer[..total])) {
                Ok(frame) => {
                    self.buffer.drain(..total);
                    if self.core.want_master.is_set()
                        && frame.function() == Function::Token
                        && frame.destination() == HOST_ADDRESS
                    {
                        if let Err(e) = self.accept_token(frame.sender()) {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                    return Some(Ok(frame));
                }
                Err(e) => {
                    trace!(error = %e, "dropping one byte to resynchronise");
                    self.buffer.remove(0);
                }
            }
        }
    }
}

/// Supervisor loop: keep the port open for the life of the link.
fn supervise(core: &LinkCore) {
    debug!("supervisor running");
    let mut rng = rand::thread_rng();

    while !core.stop.load(Ordering::SeqCst) {
        thread::sleep(core.config.con_status_period);
        if core.stop.load(Ordering::SeqCst) {
            break;
        }

        if core.lock_port().is_some() {
            trace!(im_master = core.im_master.load(Ordering::SeqCst), "port healthy");
            continue;
        }

        warn!("serial port lost; reconnecting");
        let mut tries = 0u32;
        while !core.stop.load(Ordering::SeqCst) {
            match core.factory.open(&core.config) {
                Ok(port) => {
                    let mut slot = core.lock_port();
                    *slot = Some(port);
                    if let Err(e) = core.check_master_locked(&mut slot) {
                        warn!(error = %e, "master check after reopen failed");
                    }
                    info!("serial port reopened");
                    break;
                }
                Err(e) => {
                    tries += 1;
                    error!(error = %e, tries, "reopen failed");
                    let jitter = Duration::from_millis(rng.gen_range(0..1000));
                    if tries < core.config.instant_reconnect_tries {
                        thread::sleep(jitter);
                    } else {
                        thread::sleep(core.config.long_reconnect_period + jitter);
                    }
                }
            }
        }
    }
    debug!("supervisor exiting");
}

/// Read until `buf` is full or a timeout tick returns nothing.
fn read_exact(port: &mut dyn BusPort, buf: &mut [u8]) -> io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        let n = port.read(&mut buf[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::port::{MockFactory, MockPort};

    fn test_config() -> LinkConfig {
        LinkConfig {
            wait_master_period: Duration::from_millis(20),
            port_timeout: Duration::from_millis(5),
            con_status_period: Duration::from_millis(10),
            long_reconnect_period: Duration::from_millis(20),
            ..LinkConfig::default()
        }
    }

    fn started_link(port: MockPort) -> SerialLink {
        let link = SerialLink::new(test_config(), MockFactory::new(port));
        link.start().unwrap();
        link
    }

    #[test]
    fn start_on_idle_line_becomes_master() {
        let port = MockPort::new();
        let link = started_link(port);
        assert!(link.is_master());
        assert!(link.is_open());
        link.stop();
        assert!(!link.is_open());
    }

    #[test]
    fn start_with_traffic_stays_slave() {
        let port = MockPort::new();
        port.push_arrivals(&[0x55]);
        let link = started_link(port);
        assert!(!link.is_master());
        link.stop();
    }

    #[test]
    fn start_surfaces_open_failure() {
        let factory = MockFactory::new(MockPort::new());
        factory.fail_opens(1);
        let link = SerialLink::new(test_config(), factory);
        assert!(matches!(link.start(), Err(LinkError::SerialConfig { .. })));
    }

    #[test]
    fn send_frame_requires_master() {
        let port = MockPort::new();
        port.push_arrivals(&[0x55]);
        let link = started_link(port);
        let frame = Frame::request(0, 1, Function::Identify, Bytes::new()).unwrap();
        assert!(matches!(link.send_frame(&frame), Err(LinkError::NoMaster)));
        link.stop();
    }

    #[test]
    fn send_frame_consumes_echo_and_reply() {
        let port = MockPort::new();
        let link = started_link(port.clone());

        // 5-byte RAM read of node 1; the scripted reply follows the echo.
        port.push_reply(&[0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0xBF]);
        let frame = Frame::request(0, 1, Function::ReadRam, vec![0x00, 0x05]).unwrap();
        let reply = link.send_frame(&frame).unwrap();

        assert_eq!(port.written(), vec![0x01, 0x22, 0x00, 0x05, 0xD8]);
        assert_eq!(reply.sender(), 1);
        assert_eq!(reply.data().as_ref(), &[0x01, 0x02, 0x03, 0x04, 0x05]);
        link.stop();
    }

    #[test]
    fn send_frame_rejects_corrupt_reply_as_write() {
        let port = MockPort::new();
        let link = started_link(port.clone());

        // Same bad checksum on every retry.
        for _ in 0..test_config().send_frame_tries {
            port.push_reply(&[0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0x00]);
        }
        let frame = Frame::request(0, 1, Function::ReadRam, vec![0x00, 0x05]).unwrap();
        assert!(matches!(link.send_frame(&frame), Err(LinkError::Write)));
        link.stop();
    }

    #[test]
    fn send_frame_retries_transient_noise_then_succeeds() {
        let port = MockPort::new();
        let link = started_link(port.clone());

        port.push_reply(&[0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0x00]); // corrupt
        port.push_reply(&[0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0xBF]); // clean
        let frame = Frame::request(0, 1, Function::ReadRam, vec![0x00, 0x05]).unwrap();
        let reply = link.send_frame(&frame).unwrap();
        assert_eq!(reply.data().as_ref(), &[0x01, 0x02, 0x03, 0x04, 0x05]);
        link.stop();
    }

    #[test]
    fn send_frame_missing_echo_is_read() {
        let port = MockPort::new();
        port.disable_echo();
        let link = SerialLink::new(test_config(), MockFactory::new(port));
        link.start().unwrap();
        let frame = Frame::request(0, 1, Function::Identify, Bytes::new()).unwrap();
        assert!(matches!(link.send_frame(&frame), Err(LinkError::Read)));
        link.stop();
    }

    #[test]
    fn check_master_flips_both_ways() {
        let port = MockPort::new();
        let link = started_link(port.clone());
        assert!(link.is_master());

        port.push_arrivals(&[0x42]);
        assert!(!link.check_master().unwrap());
        assert!(!link.is_master());

        assert!(link.check_master().unwrap());
        assert!(link.is_master());
        link.stop();
    }

    #[test]
    fn offer_token_errors_when_still_master() {
        let port = MockPort::new();
        let link = started_link(port.clone());
        // Peer echoes (mock does) and stays silent; the line stays idle so
        // the follow-up master check still sees us as master.
        assert!(matches!(link.offer_token(5), Err(LinkError::Token { destination: 5 })));
        link.stop();
    }

    #[test]
    fn offer_token_success_clears_mastership() {
        let port = MockPort::new();
        let link = started_link(port.clone());
        // Accept reply plus follow-up traffic: the new master starts talking.
        port.push_reply(&[0x50, 0xE0, 0xD0]);
        port.push_arrivals(&[0x01]);
        link.offer_token(5).unwrap();
        assert!(!link.is_master());
        link.stop();
    }

    #[test]
    fn master_flags_expire() {
        let mut config = test_config();
        config.master_event_timeout = Duration::ZERO;
        let link = SerialLink::new(config, MockFactory::new(MockPort::new()));
        link.request_master();
        assert!(!link.wants_master());
        link.offer_master(3);
        assert_eq!(link.take_give_master(), None);
    }
}
