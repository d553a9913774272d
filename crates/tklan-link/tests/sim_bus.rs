//! Full node flows against the simulated bus peer.
//!
//! Unlike the byte-scripted suite, these tests let the emulated node
//! compute its own replies, so they exercise the request encoding and the
//! reply handling together over realistic multi-step flows.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use tklan_link::{LinkConfig, LinkError, Node, NodeStatus, SerialLink, SimFactory, SimNode};
use tklan_proto::AppLine;

const RECORD: [u8; 8] = [0xFA, 0x80, 0x02, 0xA0, 0x00, 0x10, 0x14, 0x14];

fn sim_link(node: SimNode) -> Arc<SerialLink> {
    let config = LinkConfig {
        wait_master_period: Duration::from_millis(20),
        port_timeout: Duration::from_millis(5),
        con_status_period: Duration::from_millis(10),
        long_reconnect_period: Duration::from_millis(20),
        ..LinkConfig::default()
    };
    let link = Arc::new(SerialLink::new(config, SimFactory::new(node)));
    link.start().unwrap();
    assert!(link.is_master(), "a well-behaved slave leaves the line idle");
    link
}

#[test]
fn identify_then_read_and_write_ram() {
    let sim = SimNode::new(1, &RECORD);
    let link = sim_link(sim.clone());
    let mut node = Node::new(1, Arc::clone(&link)).unwrap();

    node.identify(None).unwrap();
    assert_eq!(node.state().status, NodeStatus::Ok);
    assert_eq!(node.state().buffer_size, 0x10);
    assert_eq!(node.state().eeprom_size, 128);

    node.write_ram(4, &[0xDE, 0xAD]).unwrap();
    assert_eq!(&sim.ram()[4..6], &[0xDE, 0xAD]);

    let snapshot = node.read_ram(4, 2).unwrap();
    assert_eq!(snapshot.get(4), Some(0xDE));
    assert_eq!(snapshot.get(5), Some(0xAD));
    link.stop();
}

#[test]
fn eeprom_round_trip() {
    let sim = SimNode::new(2, &RECORD);
    let link = sim_link(sim.clone());
    let mut node = Node::new(2, Arc::clone(&link)).unwrap();
    node.identify(None).unwrap();

    node.write_eeprom(10, &[0x01, 0x02, 0x03]).unwrap();
    assert_eq!(&sim.eeprom()[10..13], &[0x01, 0x02, 0x03]);

    let snapshot = node.read_eeprom(10, 3).unwrap();
    assert_eq!(snapshot.data.as_ref(), &[0x01, 0x02, 0x03]);
    link.stop();
}

#[test]
fn application_transfer_cycle() {
    let sim = SimNode::new(1, &RECORD);
    let link = sim_link(sim.clone());
    let mut node = Node::new(1, Arc::clone(&link)).unwrap();
    node.identify(None).unwrap();

    // The node powers up with the application running.
    let (_, active) = node.check_app_state().unwrap();
    assert!(active);

    node.deactivate_app(true).unwrap();
    assert!(!node.state().app_active);

    // Flash a 16-byte line, then read it back word by word.
    let line = AppLine::parse(":1080000000F085FF00F085FF00F085FF00F085FFA0").unwrap();
    node.write_app_line(&line).unwrap();
    assert_eq!(sim.app_byte(0x4000, 0), Some(0x00));
    assert_eq!(sim.app_byte(0x4000, 1), Some(0xF0));
    assert_eq!(sim.app_byte(0x4000, 15), Some(0xFF));

    node.activate_app().unwrap();
    assert!(node.state().app_active);

    let read_back = node.read_app_line(0x4000, 8).unwrap();
    assert_eq!(read_back.data.as_ref(), line.data.as_ref());
    assert_eq!(read_back.start, 0x4000);
    link.stop();
}

#[test]
fn write_while_app_running_is_refused() {
    let sim = SimNode::new(1, &RECORD);
    let link = sim_link(sim);
    let mut node = Node::new(1, Arc::clone(&link)).unwrap();
    node.identify(None).unwrap();

    let line = AppLine::parse(":1080000000F085FF00F085FF00F085FF00F085FFA0").unwrap();
    assert!(matches!(node.write_app_line(&line), Err(LinkError::ActiveApp { address: 1 })));
    link.stop();
}

#[test]
fn token_returns_to_the_node() {
    let sim = SimNode::new(1, &RECORD);
    let link = sim_link(sim.clone());
    let mut node = Node::new(1, Arc::clone(&link)).unwrap();

    node.return_token().unwrap();
    assert!(sim.is_master());
    assert!(!link.is_master());
    assert_eq!(node.state().status, NodeStatus::Ok);
    link.stop();
}
