//! TKLan serial link driver.
//!
//! The host side of the bus: port lifecycle under a supervisor thread,
//! echo-consuming request/reply transactions, the slave-mode framing
//! reader with token hand-off, and the per-node request vocabulary.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tklan_link::{LinkConfig, Node, SerialLink, SystemPortFactory};
//!
//! # fn main() -> tklan_link::Result<()> {
//! let link = Arc::new(SerialLink::new(LinkConfig::default(), SystemPortFactory));
//! link.start()?;
//!
//! let mut node = Node::new(1, Arc::clone(&link))?;
//! node.identify(None)?;
//! let snapshot = node.read_ram(0, 2)?;
//! println!("byte 0 = {:?}", snapshot.get(0));
//!
//! link.stop();
//! # Ok(())
//! # }
//! ```
//!
//! All port I/O is blocking and serialized under one mutex; see
//! [`SerialLink`] for the ordering guarantees. The [`port::MockPort`]
//! scripted port drives the whole state machine in tests without hardware.

pub mod port;
pub mod sim;

mod config;
mod error;
mod flags;
mod link;
mod node;

pub use config::LinkConfig;
pub use error::{LinkError, Result};
pub use flags::DeadlineFlag;
pub use link::{Listener, SerialLink};
pub use node::{
    APP_CONFIG_BASE, APP_EEPROM_BASE, MemoryContainer, MemoryKind, Node, NodeState, NodeStatus,
    ServiceFlags, WRITE_CHUNK,
};
pub use port::{BusPort, MockFactory, MockPort, PortFactory, SystemPortFactory};
pub use sim::{SimFactory, SimNode};

/// Bus address of this host. The gateway computer is node 0 by convention.
pub const HOST_ADDRESS: u8 = 0;
