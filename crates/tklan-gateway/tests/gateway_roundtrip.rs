//! Gateway end-to-end: JSON clients over real sockets, scripted serial
//! port underneath.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use tklan_client::{CommandClient, Subscriber};
use tklan_gateway::{Gateway, GatewayConfig};
use tklan_link::{LinkConfig, MockFactory, MockPort, SerialLink};
use tklan_proto::{
    codec,
    wire::{CommandRequest, Event, Reply},
};

fn test_link_config() -> LinkConfig {
    LinkConfig {
        wait_master_period: Duration::from_millis(20),
        port_timeout: Duration::from_millis(5),
        con_status_period: Duration::from_millis(10),
        long_reconnect_period: Duration::from_millis(20),
        ..LinkConfig::default()
    }
}

fn with_checksum(bytes: &[u8]) -> Vec<u8> {
    let mut wire = bytes.to_vec();
    wire.push(codec::checksum(bytes));
    wire
}

struct Running {
    link: Arc<SerialLink>,
    port: MockPort,
    commands: String,
    publisher: String,
}

async fn start_gateway(slave: bool, streaming: Vec<CommandRequest>) -> Running {
    let port = MockPort::new();
    if slave {
        port.push_arrivals(&[0x55]);
    }
    let link = Arc::new(SerialLink::new(test_link_config(), MockFactory::new(port.clone())));
    link.start().unwrap();

    let config = GatewayConfig {
        commands_addr: "127.0.0.1:0".to_string(),
        publisher_addr: "127.0.0.1:0".to_string(),
        poll_period: Duration::from_millis(20),
        streaming,
    };
    let gateway = Gateway::bind(Arc::clone(&link), config).await.unwrap();
    let commands = gateway.commands_addr().unwrap().to_string();
    let publisher = gateway.publisher_addr().unwrap().to_string();
    tokio::spawn(gateway.run());

    Running { link, port, commands, publisher }
}

fn read_ram_request() -> CommandRequest {
    CommandRequest {
        sender: 0,
        destination: 1,
        function: 1,
        data: "0005".to_string(),
        validate: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn command_round_trip() {
    let running = start_gateway(false, Vec::new()).await;
    assert!(running.link.is_master());
    running.port.push_reply(&[0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0xBF]);

    let mut client = CommandClient::connect(&running.commands).await.unwrap();
    match client.send(&read_ram_request()).await.unwrap() {
        Reply::Frame(frame) => {
            assert_eq!(frame.sender, 1);
            assert_eq!(frame.destination, 0);
            assert_eq!(frame.function, 1);
            assert_eq!(frame.data, "0102030405");
            assert_eq!(frame.checksum, "bf");
        }
        Reply::Error(e) => panic!("unexpected error reply: {}", e.error),
    }
    running.link.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn no_master_becomes_an_error_reply() {
    let running = start_gateway(true, Vec::new()).await;
    assert!(!running.link.is_master());

    let mut client = CommandClient::connect(&running.commands).await.unwrap();
    match client.send(&read_ram_request()).await.unwrap() {
        Reply::Error(e) => {
            assert_eq!(e.request, read_ram_request());
            assert!(e.error.contains("master"), "unexpected message: {}", e.error);
        }
        Reply::Frame(_) => panic!("expected an error reply"),
    }
    running.link.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_shape_is_rejected_unless_validation_is_off() {
    let running = start_gateway(false, Vec::new()).await;

    let mut odd = read_ram_request();
    odd.data = "09".to_string();

    let mut client = CommandClient::connect(&running.commands).await.unwrap();
    match client.send(&odd).await.unwrap() {
        Reply::Error(e) => assert!(e.error.contains("invalid frame"), "got: {}", e.error),
        Reply::Frame(_) => panic!("expected a validation error"),
    }

    // Same shape with validation off goes out on the wire; the node
    // answers an empty read.
    running.port.push_reply(&with_checksum(&[0x10, 0x20]));
    odd.validate = Some(false);
    match client.send(&odd).await.unwrap() {
        Reply::Frame(frame) => assert_eq!(frame.data, ""),
        Reply::Error(e) => panic!("unexpected error reply: {}", e.error),
    }
    running.link.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn publisher_fans_out_request_and_reply() {
    let running = start_gateway(false, Vec::new()).await;
    running.port.push_reply(&[0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0xBF]);

    let mut subscriber = Subscriber::connect(&running.publisher).await.unwrap();
    // Give the accept loop a beat to register the subscription.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = CommandClient::connect(&running.commands).await.unwrap();
    client.send(&read_ram_request()).await.unwrap();

    match subscriber.next_event().await.unwrap() {
        Event::Request(request) => assert_eq!(request, read_ram_request()),
        other => panic!("expected the request first, got {other:?}"),
    }
    match subscriber.next_event().await.unwrap() {
        Event::Frame(frame) => assert_eq!(frame.data, "0102030405"),
        other => panic!("expected the reply, got {other:?}"),
    }
    running.link.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_schedule_pumps_while_idle() {
    let schedule = vec![read_ram_request()];
    let running = start_gateway(false, schedule).await;
    for _ in 0..64 {
        running.port.push_reply(&[0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0xBF]);
    }

    let mut subscriber = Subscriber::connect(&running.publisher).await.unwrap();

    // No client commands at all: the schedule alone produces traffic. The
    // subscription may land mid-exchange, so align on the next request.
    loop {
        match subscriber.next_event().await.unwrap() {
            Event::Request(request) => {
                assert_eq!(request, read_ram_request());
                break;
            }
            Event::Frame(_) => {}
            other @ Event::Exception { .. } => panic!("unexpected event: {other:?}"),
        }
    }
    match subscriber.next_event().await.unwrap() {
        Event::Frame(frame) => assert_eq!(frame.data, "0102030405"),
        other => panic!("expected a streamed reply, got {other:?}"),
    }
    running.link.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_lines_get_a_bare_error() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let running = start_gateway(false, Vec::new()).await;
    let stream = tokio::net::TcpStream::connect(&running.commands).await.unwrap();
    let (read, mut write) = stream.into_split();
    write.write_all(b"this is not json\n").await.unwrap();

    let mut lines = BufReader::new(read).lines();
    let reply = lines.next_line().await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert!(value["error"].as_str().unwrap().contains("malformed"));
    running.link.stop();
}
