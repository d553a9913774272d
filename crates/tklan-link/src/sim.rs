//! Simulated bus peer.
//!
//! [`SimNode`] is a [`BusPort`] that behaves like the far end of the line:
//! it echoes every transmitted byte (half-duplex transceiver) and then
//! answers frames addressed to it the way a real field device would.
//! Where [`crate::port::MockPort`] scripts exact byte sequences, `SimNode`
//! emulates a whole node, so tests can run complete flows (identify, read,
//! write, application transfer, token hand-over) without spelling out
//! every reply.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tklan_proto::{
    APP_ACTIVATE, APP_ACTIVATE_REPLY, APP_DEACTIVATE, APP_DEACTIVATE_REPLY, Frame, Function,
};

use crate::{
    config::LinkConfig,
    error::Result,
    port::{BusPort, PortFactory},
};

/// Application run-state byte: running.
const APP_RUNNING: u8 = 0x80;

/// One emulated remote node behind an in-memory line.
///
/// Clones share state; keep one clone in the test to inspect memories and
/// tweak behavior.
#[derive(Debug, Clone)]
pub struct SimNode {
    state: Arc<Mutex<SimState>>,
}

#[derive(Debug)]
struct SimState {
    address: u8,
    /// Bytes waiting for the host to read.
    input: VecDeque<u8>,
    /// Identification record answered to f=0.
    record: Vec<u8>,
    ram: Vec<u8>,
    eeprom: Vec<u8>,
    /// Application memory, byte-addressed (word index times two).
    app: HashMap<u32, u8>,
    /// Whether the node holds the token (it then chats on the line).
    master: bool,
}

impl SimNode {
    /// Emulate a node at `address` with the given identify record.
    ///
    /// RAM byte 0 starts with the application running, matching a node
    /// fresh from power-up.
    #[must_use]
    pub fn new(address: u8, record: &[u8]) -> Self {
        let mut ram = vec![0u8; 256];
        ram[0] = APP_RUNNING;
        Self {
            state: Arc::new(Mutex::new(SimState {
                address,
                input: VecDeque::new(),
                record: record.to_vec(),
                ram,
                eeprom: vec![0u8; 256],
                app: HashMap::new(),
                master: false,
            })),
        }
    }

    /// Current RAM contents.
    #[must_use]
    pub fn ram(&self) -> Vec<u8> {
        self.lock().ram.clone()
    }

    /// Current EEPROM contents.
    #[must_use]
    pub fn eeprom(&self) -> Vec<u8> {
        self.lock().eeprom.clone()
    }

    /// Application byte at word `word`, offset `offset`.
    #[must_use]
    pub fn app_byte(&self, word: u16, offset: u32) -> Option<u8> {
        self.lock().app.get(&(u32::from(word) * 2 + offset)).copied()
    }

    /// Whether the node believes it holds the token.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.lock().master
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SimState {
    /// Answer one frame addressed to this node. Returns the reply payload
    /// bytes, `None` when the node stays silent.
    fn respond(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        let data = frame.data();
        match frame.function() {
            Function::Identify => Some(self.record.clone()),
            Function::ReadRam | Function::ReadEeprom => {
                let start = usize::from(*data.first()?);
                let count = usize::from(*data.get(1)?);
                let memory = if frame.function() == Function::ReadRam {
                    &self.ram
                } else {
                    &self.eeprom
                };
                Some(memory.get(start..start + count)?.to_vec())
            }
            Function::WriteRam | Function::WriteEeprom => {
                let start = usize::from(*data.first()?);
                let payload = &data[1..];
                let memory = if frame.function() == Function::WriteRam {
                    &mut self.ram
                } else {
                    &mut self.eeprom
                };
                memory.get_mut(start..start + payload.len())?.copy_from_slice(payload);
                Some(data.to_vec())
            }
            Function::ReadApp => {
                let word = u16::from(*data.first()?) | u16::from(*data.get(1)?) << 8;
                let count = u32::from(*data.get(2)?);
                let base = u32::from(word) * 2;
                let bytes = (0..count * 2)
                    .map(|i| self.app.get(&(base + i)).copied().unwrap_or(0xFF))
                    .collect();
                Some(bytes)
            }
            Function::WriteApp => {
                if data.as_ref() == APP_ACTIVATE {
                    self.ram[0] = APP_RUNNING;
                    return Some(vec![APP_ACTIVATE_REPLY]);
                }
                if data.as_ref() == APP_DEACTIVATE {
                    self.ram[0] = 0x00;
                    return Some(vec![APP_DEACTIVATE_REPLY]);
                }
                let word = u16::from(*data.first()?) | u16::from(*data.get(1)?) << 8;
                let base = u32::from(word) * 2;
                for (i, byte) in data[2..].iter().enumerate() {
                    self.app.insert(base + i as u32, *byte);
                }
                // The bootloader acknowledges with a full line-sized record.
                Some(vec![0u8; 10])
            }
            Function::Token => {
                self.master = true;
                Some(Vec::new())
            }
        }
    }
}

impl BusPort for SimNode {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        // A node holding the token keeps the line busy, which is exactly
        // what the host's master detection listens for.
        if state.input.is_empty() && state.master {
            state.input.push_back(0x00);
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
        let mut state = self.lock();
        // Transceiver echo first, always.
        state.input.extend(buf.iter().copied());

        let Ok(frame) = Frame::parse(buf.to_vec()) else {
            return Ok(());
        };
        if frame.destination() != state.address {
            return Ok(());
        }
        if let Some(payload) = state.respond(&frame) {
            let address = state.address;
            if let Ok(reply) =
                Frame::request_unchecked(address, frame.sender(), frame.function(), payload)
            {
                state.input.extend(reply.as_bytes().iter().copied());
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.lock().input.clear();
        Ok(())
    }
}

/// Factory handing out clones of one [`SimNode`].
#[derive(Debug, Clone)]
pub struct SimFactory {
    node: SimNode,
}

impl SimFactory {
    /// Factory for the given emulated node.
    #[must_use]
    pub fn new(node: SimNode) -> Self {
        Self { node }
    }
}

impl PortFactory for SimFactory {
    fn open(&self, _config: &LinkConfig) -> Result<Box<dyn BusPort>> {
        Ok(Box::new(self.node.clone()))
    }
}
