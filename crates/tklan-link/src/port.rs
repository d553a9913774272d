//! Serial port abstraction.
//!
//! The link state machine is written against [`BusPort`] so that every
//! timing- and framing-sensitive path can run deterministically in tests.
//! Production uses [`SystemPortFactory`] over the `serialport` crate; tests
//! use [`MockPort`], which scripts inbound bytes and simulates the
//! half-duplex transceiver echo.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    config::LinkConfig,
    error::{LinkError, Result},
};

/// One open serial device.
///
/// Reads are blocking up to the configured port timeout and return `Ok(0)`
/// when the timeout passes with nothing on the line (the "nobody is
/// talking" signal the master detector relies on).
pub trait BusPort: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the timeout elapsed.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Drop everything currently buffered on the input side.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens ports. The supervisor re-invokes this after every port loss.
pub trait PortFactory: Send + Sync {
    /// Open the port described by `config`.
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn BusPort>>;
}

/// Production factory over the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortFactory;

impl PortFactory for SystemPortFactory {
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn BusPort>> {
        let inner = serialport::new(&config.serial_port, config.baudrate)
            .timeout(config.port_timeout)
            .open()
            .map_err(|e| LinkError::SerialConfig { message: e.to_string() })?;
        Ok(Box::new(SystemPort { inner }))
    }
}

struct SystemPort {
    inner: Box<dyn serialport::SerialPort>,
}

impl BusPort for SystemPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match io::Read::read(&mut self.inner, buf) {
            // The serial layer reports an idle timeout as an error; the bus
            // treats silence as data ("nobody answered"), so map it to 0.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.inner, buf)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.inner.clear(serialport::ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Scripted in-memory port with transceiver-echo semantics.
///
/// Two inbound queues model the two ways bytes reach the driver:
///
/// - `input` holds bytes available right now. Writes append their own echo
///   here (half-duplex transceivers reflect every transmitted byte), then
///   the next scripted reply, preserving echo-before-reply ordering.
/// - `arrivals` holds bytes that "arrive later": they transfer to `input`
///   only when a read finds it empty, so they survive the input flush at
///   the start of a transaction or master check.
///
/// Clones share state; keep one clone in the test to script and inspect.
#[derive(Debug, Clone, Default)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    input: VecDeque<u8>,
    arrivals: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    echo: bool,
    read_failures: usize,
    write_failures: usize,
}

impl MockPort {
    /// New port with echo simulation on.
    #[must_use]
    pub fn new() -> Self {
        let port = Self::default();
        port.state_mut().echo = true;
        port
    }

    /// Disable the transceiver echo (a broken line).
    pub fn disable_echo(&self) {
        self.state_mut().echo = false;
    }

    /// Queue bytes that arrive on the line independently of any write.
    pub fn push_arrivals(&self, bytes: &[u8]) {
        self.state_mut().arrivals.extend(bytes.iter().copied());
    }

    /// Script the reply to the next write. Replies are consumed in order,
    /// each appearing right after its write's echo.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.state_mut().replies.push_back(bytes.to_vec());
    }

    /// Everything written to the port so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.state_mut().written.clone()
    }

    /// Make the next `n` reads fail with a broken-pipe error.
    pub fn fail_reads(&self, n: usize) {
        self.state_mut().read_failures = n;
    }

    /// Make the next `n` writes fail with a broken-pipe error.
    pub fn fail_writes(&self, n: usize) {
        self.state_mut().write_failures = n;
    }

    fn state_mut(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BusPort for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state_mut();
        if state.read_failures > 0 {
            state.read_failures -= 1;
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if state.input.is_empty() {
            let pending: Vec<u8> = state.arrivals.drain(..).collect();
            state.input.extend(pending);
        }
        let mut n = 0;
        while n < buf.len() {
            match state.input.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state_mut();
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.written.extend_from_slice(buf);
        if state.echo {
            state.input.extend(buf.iter().copied());
        }
        if let Some(reply) = state.replies.pop_front() {
            state.input.extend(reply);
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state_mut().input.clear();
        Ok(())
    }
}

/// Factory handing out clones of one [`MockPort`], optionally failing the
/// first few opens (reconnect testing).
#[derive(Debug, Default)]
pub struct MockFactory {
    port: MockPort,
    fail_opens: Mutex<usize>,
}

impl MockFactory {
    /// Factory for the given scripted port.
    #[must_use]
    pub fn new(port: MockPort) -> Self {
        Self { port, fail_opens: Mutex::new(0) }
    }

    /// Fail the next `n` open attempts.
    pub fn fail_opens(&self, n: usize) {
        *self.fail_opens.lock().unwrap_or_else(PoisonError::into_inner) = n;
    }
}

impl PortFactory for MockFactory {
    fn open(&self, _config: &LinkConfig) -> Result<Box<dyn BusPort>> {
        let mut failures = self.fail_opens.lock().unwrap_or_else(PoisonError::into_inner);
        if *failures > 0 {
            *failures -= 1;
            return Err(LinkError::SerialConfig { message: "scripted open failure".to_string() });
        }
        Ok(Box::new(self.port.clone()))
    }
}
