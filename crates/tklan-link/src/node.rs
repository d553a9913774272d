//! Per-node operations on top of the serial link.
//!
//! A [`Node`] wraps one remote address and the request vocabulary the bus
//! offers for it: identification, RAM/EEPROM access, application-memory
//! transfer and the application run-state controls. Until [`Node::identify`]
//! completes, conservative default sizes from the link configuration apply.

use std::{sync::Arc, time::SystemTime};

use bytes::Bytes;
use tklan_proto::{
    APP_ACTIVATE, APP_ACTIVATE_REPLY, APP_DEACTIVATE, APP_DEACTIVATE_REPLY, AppLine, Frame,
    Function, MAX_ADDRESS, ProtocolError,
};
use tracing::{debug, info, warn};

use crate::{
    HOST_ADDRESS,
    error::{LinkError, Result},
    link::SerialLink,
};

/// First word of the node's configuration region in app-memory addressing.
pub const APP_CONFIG_BASE: u16 = 8192;

/// App-memory addresses above this map to the EEPROM-backed configuration.
pub const APP_EEPROM_BASE: u16 = 8448;

/// Bytes of application memory written per f=6 frame.
pub const WRITE_CHUNK: usize = 8;

/// Mask of the application-running bit in RAM byte 0 (high bit of the MSB).
const APP_ACTIVE_MASK: u8 = 0x80;

/// Mask of the deactivation-requested bit in RAM byte 0 (bit 6 of the
/// wire bit array).
const DEACTIVATION_REQUESTED_MASK: u8 = 0x02;

/// Connection status of one remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeStatus {
    /// Never heard from.
    #[default]
    Unseen,
    /// Answered its last transaction.
    Ok,
    /// Answered in the past but currently doubtful.
    Quarantined,
    /// Did not answer an identify while we were master.
    Absent,
}

/// Which directly-addressable memory space a container came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Volatile memory.
    Ram,
    /// Persistent memory.
    Eeprom,
}

/// Service feature flags from the identify reply, two bytes decoded
/// bitwise. Bit 0 is the high bit of the first byte, matching the wire
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceFlags {
    raw: [u8; 2],
}

impl ServiceFlags {
    /// Wrap the two raw service bytes.
    #[must_use]
    pub fn from_bytes(raw: [u8; 2]) -> Self {
        Self { raw }
    }

    /// The raw service bytes.
    #[must_use]
    pub fn as_bytes(&self) -> [u8; 2] {
        self.raw
    }

    /// Whether service bit `bit` (0-15, MSB-first) is advertised.
    #[must_use]
    pub fn is_set(&self, bit: u8) -> bool {
        if bit >= 16 {
            return false;
        }
        let byte = self.raw[(bit / 8) as usize];
        byte & (0x80 >> (bit % 8)) != 0
    }
}

/// Everything known about one remote node.
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Bus address, 0-15.
    pub address: u8,
    /// Connection status.
    pub status: NodeStatus,
    /// Refreshed exactly when `status` transitions to [`NodeStatus::Ok`].
    pub last_seen: Option<SystemTime>,
    /// Maximum per-packet payload the node accepts.
    pub buffer_size: u8,
    /// EEPROM bytes available.
    pub eeprom_size: u16,
    /// Readable RAM bytes.
    pub ram_read_size: u8,
    /// Writable RAM bytes.
    pub ram_write_size: u8,
    /// First word of the application image.
    pub app_start: u16,
    /// Last word of the application image.
    pub app_end: u16,
    /// Advertised service bits.
    pub services: ServiceFlags,
    /// Configuration-region base reported by newer node software.
    pub ini_config: Option<u8>,
    /// EEPROM-region base reported by newer node software.
    pub ini_eeprom: Option<u8>,
    /// Whether the node application is running.
    pub app_active: bool,
    /// Whether a deactivation has been requested and is pending.
    pub deactivation_requested: bool,
}

/// A timestamped consistent snapshot of one contiguous memory range.
///
/// All bytes in a container were read in a single frame, so they coexisted
/// on the node at `timestamp`. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    /// Node the range was read from.
    pub address: u8,
    /// Memory space it came from.
    pub kind: MemoryKind,
    /// Index of the first byte.
    pub start: u8,
    /// The bytes.
    pub data: Bytes,
    /// When the read completed.
    pub timestamp: SystemTime,
}

impl MemoryContainer {
    /// Byte at absolute index `index`, `None` outside the snapshot.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u8> {
        let start = self.start as usize;
        if index < start {
            return None;
        }
        self.data.get(index - start).copied()
    }
}

/// One remote node on the bus.
pub struct Node {
    link: Arc<SerialLink>,
    state: NodeState,
}

impl Node {
    /// Bind address `address` on the given link.
    ///
    /// # Errors
    ///
    /// `ProtocolError::Encode` (wrapped) when the address is out of range.
    pub fn new(address: u8, link: Arc<SerialLink>) -> Result<Self> {
        if address > MAX_ADDRESS {
            return Err(LinkError::Protocol(ProtocolError::Encode {
                field: "address",
                value: address as usize,
                max: MAX_ADDRESS as usize,
            }));
        }
        let config = link.config();
        let state = NodeState {
            address,
            status: NodeStatus::Unseen,
            last_seen: None,
            buffer_size: config.default_buffer_size,
            eeprom_size: config.default_eeprom_size,
            ram_read_size: config.default_ram_read_size,
            ram_write_size: config.default_ram_write_size,
            app_start: 0x8000,
            app_end: 0xFAFF,
            services: ServiceFlags::default(),
            ini_config: None,
            ini_eeprom: None,
            app_active: true,
            deactivation_requested: false,
        };
        Ok(Self { link, state })
    }

    /// Current knowledge about the node.
    #[must_use]
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Bus address.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.state.address
    }

    fn set_status(&mut self, status: NodeStatus) {
        if status == NodeStatus::Ok {
            self.state.last_seen = Some(SystemTime::now());
        }
        self.state.status = status;
    }

    /// Run one transaction for this node.
    ///
    /// A node that answered its identify but now fails on the line while
    /// we hold the token is doubtful rather than gone: demote it to
    /// [`NodeStatus::Quarantined`] until the next identify settles it.
    fn transact(&mut self, request: &Frame) -> Result<Frame> {
        match self.link.send_frame(request) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if matches!(e, LinkError::Read | LinkError::Write)
                    && self.link.is_master()
                    && self.state.status == NodeStatus::Ok
                {
                    warn!(node = self.state.address, error = %e, "node stopped answering");
                    self.set_status(NodeStatus::Quarantined);
                }
                Err(e)
            }
        }
    }

    /// Identify the node and record its geometry.
    ///
    /// Either issues an f=0 request or unpacks an externally supplied reply
    /// (a frame overheard in slave mode, say). Replies shorter than the
    /// full record keep the defaulted fields and still succeed: old node
    /// software reports fewer bytes.
    ///
    /// # Errors
    ///
    /// `LinkError::NodeNotExists` when the transaction fails while this
    /// host is master; other failures propagate with the status unchanged.
    pub fn identify(&mut self, reply: Option<Frame>) -> Result<()> {
        info!(node = self.state.address, "identifying");
        let reply = match reply {
            Some(frame) => {
                if frame.function() != Function::Identify {
                    return Err(LinkError::Protocol(ProtocolError::InvalidFrame {
                        function: frame.function().to_u8(),
                        reason: "identify expects a function 0 reply",
                    }));
                }
                frame
            }
            None => {
                let request =
                    Frame::request(HOST_ADDRESS, self.state.address, Function::Identify, Bytes::new())?;
                match self.link.send_frame(&request) {
                    Ok(reply) => reply,
                    Err(e) if matches!(e, LinkError::Read | LinkError::Write)
                        && self.link.is_master() =>
                    {
                        warn!(node = self.state.address, error = %e, "node did not answer identify");
                        self.set_status(NodeStatus::Absent);
                        return Err(LinkError::NodeNotExists { address: self.state.address });
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let data = reply.data();
        if let Some(&hi) = data.first() {
            self.state.app_end = u16::from(hi) * 256 + 255;
        }
        if let Some(&hi) = data.get(1) {
            self.state.app_start = u16::from(hi) * 256;
        }
        if let Some(&blocks) = data.get(2) {
            self.state.eeprom_size = u16::from(blocks) * 64;
        }
        if let (Some(&s0), Some(&s1)) = (data.get(3), data.get(4)) {
            self.state.services = ServiceFlags::from_bytes([s0, s1]);
        }
        if let Some(&buffer) = data.get(5) {
            self.state.buffer_size = buffer;
        }
        if let Some(&ram_write) = data.get(6) {
            self.state.ram_write_size = ram_write;
        }
        if let Some(&ram_read) = data.get(7) {
            self.state.ram_read_size = ram_read;
        }
        self.state.ini_config = data.get(8).copied();
        self.state.ini_eeprom = data.get(9).copied();
        if data.len() < 8 {
            warn!(
                node = self.state.address,
                got = data.len(),
                "short identify record, keeping defaults for the missing fields"
            );
        }

        self.set_status(NodeStatus::Ok);
        debug!(node = self.state.address, state = ?self.state, "identified");
        Ok(())
    }

    /// Read `count` bytes of RAM starting at `start`.
    pub fn read_ram(&mut self, start: u8, count: u8) -> Result<MemoryContainer> {
        self.read_memory(start, count, MemoryKind::Ram)
    }

    /// Read `count` bytes of EEPROM starting at `start`.
    pub fn read_eeprom(&mut self, start: u8, count: u8) -> Result<MemoryContainer> {
        self.read_memory(start, count, MemoryKind::Eeprom)
    }

    /// Write `data` to RAM starting at `start`. Returns the request/reply
    /// pair.
    pub fn write_ram(&mut self, start: u8, data: &[u8]) -> Result<(Frame, Frame)> {
        self.write_memory(start, data, MemoryKind::Ram)
    }

    /// Write `data` to EEPROM starting at `start`. Returns the
    /// request/reply pair.
    pub fn write_eeprom(&mut self, start: u8, data: &[u8]) -> Result<(Frame, Frame)> {
        self.write_memory(start, data, MemoryKind::Eeprom)
    }

    fn read_memory(&mut self, start: u8, count: u8, kind: MemoryKind) -> Result<MemoryContainer> {
        let limit = match kind {
            MemoryKind::Ram => usize::from(self.state.ram_read_size),
            MemoryKind::Eeprom => usize::from(self.state.eeprom_size),
        };
        let end = usize::from(start) + usize::from(count);
        if end > limit {
            return Err(LinkError::Range { what: "read range end", value: end, max: limit });
        }
        if usize::from(count) > usize::from(self.state.buffer_size) {
            return Err(LinkError::Range {
                what: "read count",
                value: usize::from(count),
                max: usize::from(self.state.buffer_size),
            });
        }

        let function = match kind {
            MemoryKind::Ram => Function::ReadRam,
            MemoryKind::Eeprom => Function::ReadEeprom,
        };
        debug!(node = self.state.address, ?kind, start, count, "reading memory");
        let request =
            Frame::request(HOST_ADDRESS, self.state.address, function, vec![start, count])?;
        let reply = self.transact(&request)?;

        Ok(MemoryContainer {
            address: reply.sender(),
            kind,
            start,
            data: reply.data().clone(),
            timestamp: SystemTime::now(),
        })
    }

    fn write_memory(&mut self, start: u8, data: &[u8], kind: MemoryKind) -> Result<(Frame, Frame)> {
        if data.is_empty() {
            return Err(LinkError::Range { what: "write length", value: 0, max: 0 });
        }
        // One byte of the packet budget is the start address.
        let payload_limit = usize::from(self.state.buffer_size).saturating_sub(1);
        if data.len() > payload_limit {
            return Err(LinkError::Range {
                what: "write length",
                value: data.len(),
                max: payload_limit,
            });
        }
        let limit = match kind {
            MemoryKind::Ram => usize::from(self.state.ram_write_size),
            MemoryKind::Eeprom => usize::from(self.state.eeprom_size),
        };
        let end = usize::from(start) + data.len();
        if end > limit {
            return Err(LinkError::Range { what: "write range end", value: end, max: limit });
        }

        let function = match kind {
            MemoryKind::Ram => Function::WriteRam,
            MemoryKind::Eeprom => Function::WriteEeprom,
        };
        info!(node = self.state.address, ?kind, start, len = data.len(), "writing memory");
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(start);
        payload.extend_from_slice(data);
        let request = Frame::request(HOST_ADDRESS, self.state.address, function, payload)?;
        let reply = self.transact(&request)?;
        Ok((request, reply))
    }

    /// Read `count` words of application memory starting at word
    /// `start`.
    ///
    /// # Errors
    ///
    /// `LinkError::InactiveApp` unless the node application is running.
    pub fn read_app_line(&mut self, start: u16, count: u8) -> Result<AppLine> {
        if !self.state.app_active {
            return Err(LinkError::InactiveApp { address: self.state.address });
        }
        info!(node = self.state.address, start, count, "reading app line");
        let payload = vec![(start & 0xFF) as u8, (start >> 8) as u8, count];
        let request = Frame::request(HOST_ADDRESS, self.state.address, Function::ReadApp, payload)?;
        let reply = self.transact(&request)?;
        Ok(AppLine::from_reply(&reply, start))
    }

    /// Write one application line.
    ///
    /// Flash-region lines are split into [`WRITE_CHUNK`]-byte f=6 frames,
    /// each addressed at the line's word index plus the chunk offset in
    /// words. Configuration-region lines (above [`APP_EEPROM_BASE`]) become
    /// a single EEPROM write carrying the odd-indexed payload bytes.
    ///
    /// # Errors
    ///
    /// - `LinkError::ActiveApp` while the node application is running
    /// - `LinkError::Range` when the line falls in neither writable region
    pub fn write_app_line(&mut self, line: &AppLine) -> Result<()> {
        if self.state.app_active {
            return Err(LinkError::ActiveApp { address: self.state.address });
        }

        if line.start < self.state.app_end {
            info!(node = self.state.address, start = line.start, "writing flash line");
            for (index, chunk) in line.data.chunks(WRITE_CHUNK).enumerate() {
                let word = line.start + (index * WRITE_CHUNK / 2) as u16;
                let mut payload = Vec::with_capacity(2 + chunk.len());
                payload.push((word & 0xFF) as u8);
                payload.push((word >> 8) as u8);
                payload.extend_from_slice(chunk);
                let request =
                    Frame::request(HOST_ADDRESS, self.state.address, Function::WriteApp, payload)?;
                self.transact(&request)?;
            }
            return Ok(());
        }

        if line.start > APP_EEPROM_BASE {
            let offset = line.start - APP_CONFIG_BASE;
            let start = u8::try_from(offset).map_err(|_| LinkError::Range {
                what: "config line start",
                value: usize::from(offset),
                max: usize::from(u8::MAX),
            })?;
            info!(node = self.state.address, start, "writing config line");
            let mut payload = vec![start];
            payload.extend(line.data.iter().enumerate().filter(|(i, _)| i % 2 == 1).map(|(_, b)| *b));
            let request =
                Frame::request(HOST_ADDRESS, self.state.address, Function::WriteEeprom, payload)?;
            self.transact(&request)?;
            return Ok(());
        }

        Err(LinkError::Range {
            what: "app line start",
            value: usize::from(line.start),
            max: usize::from(self.state.app_end),
        })
    }

    /// Start the node application.
    ///
    /// # Errors
    ///
    /// - `LinkError::ActiveApp` when it is already running
    /// - `LinkError::InactiveApp` when the node refuses the activation
    pub fn activate_app(&mut self) -> Result<()> {
        if self.state.app_active {
            return Err(LinkError::ActiveApp { address: self.state.address });
        }
        info!(node = self.state.address, "activating application");
        let request =
            Frame::request(HOST_ADDRESS, self.state.address, Function::WriteApp, APP_ACTIVATE)?;
        let reply = self.transact(&request)?;
        if reply.data().as_ref() != [APP_ACTIVATE_REPLY] {
            return Err(LinkError::InactiveApp { address: self.state.address });
        }
        self.check_app_state()?;
        Ok(())
    }

    /// Stop the node application.
    ///
    /// With `blocking`, polls [`Node::check_app_state`] until the running
    /// flag clears; a node that neither stops nor reports a pending
    /// deactivation fails with `ActiveApp`.
    ///
    /// # Errors
    ///
    /// - `LinkError::InactiveApp` when it is already stopped
    /// - `LinkError::ActiveApp` when the node refuses the deactivation
    pub fn deactivate_app(&mut self, blocking: bool) -> Result<()> {
        if !self.state.app_active {
            return Err(LinkError::InactiveApp { address: self.state.address });
        }
        info!(node = self.state.address, "deactivating application");
        let request =
            Frame::request(HOST_ADDRESS, self.state.address, Function::WriteApp, APP_DEACTIVATE)?;
        let reply = self.transact(&request)?;
        if reply.data().as_ref() != [APP_DEACTIVATE_REPLY] {
            return Err(LinkError::ActiveApp { address: self.state.address });
        }

        if blocking {
            loop {
                let (requested, active) = self.check_app_state()?;
                if !active {
                    break;
                }
                if !requested {
                    return Err(LinkError::ActiveApp { address: self.state.address });
                }
            }
        }
        Ok(())
    }

    /// Probe RAM byte 0 for the application run-state bits.
    ///
    /// Returns `(deactivation_requested, app_active)` and records both in
    /// the node state.
    pub fn check_app_state(&mut self) -> Result<(bool, bool)> {
        let container = self.read_ram(0, 1)?;
        let byte = container.get(0).ok_or(LinkError::Write)?;
        self.state.app_active = byte & APP_ACTIVE_MASK != 0;
        self.state.deactivation_requested = byte & DEACTIVATION_REQUESTED_MASK != 0;
        debug!(
            node = self.state.address,
            app_active = self.state.app_active,
            deactivation_requested = self.state.deactivation_requested,
            "app state"
        );
        Ok((self.state.deactivation_requested, self.state.app_active))
    }

    /// Offer the token to this node.
    ///
    /// # Errors
    ///
    /// `LinkError::Token` when the line shows us still master afterwards.
    pub fn return_token(&mut self) -> Result<()> {
        self.link.offer_token(self.state.address)?;
        self.set_status(NodeStatus::Ok);
        Ok(())
    }
}
