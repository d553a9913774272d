//! Link configuration.
//!
//! One immutable record passed into the link constructor. Per-deployment
//! knobs only; nothing here changes at runtime.

use std::time::Duration;

/// Everything the serial link needs to know about its environment.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Path to the serial device.
    pub serial_port: String,
    /// Line speed in bits per second. Teknotrol equipment built before 2018
    /// runs at 2400; some newer devices use 9600.
    pub baudrate: u32,
    /// Timeout of a single blocking port read or write.
    pub port_timeout: Duration,
    /// Idle period after which the line is considered masterless.
    pub wait_master_period: Duration,
    /// Lifetime of the `want_master`/`give_master` request flags.
    pub master_event_timeout: Duration,
    /// Immediate reopen attempts before backing off.
    pub instant_reconnect_tries: u32,
    /// Reopen cadence once the immediate attempts are exhausted.
    pub long_reconnect_period: Duration,
    /// How often the supervisor reports and checks port health.
    pub con_status_period: Duration,
    /// Retry budget for transient failures within one transaction.
    pub send_frame_tries: u32,
    /// Per-packet payload limit assumed until a node is identified.
    pub default_buffer_size: u8,
    /// EEPROM size assumed until a node is identified.
    pub default_eeprom_size: u16,
    /// Readable RAM size assumed until a node is identified.
    pub default_ram_read_size: u8,
    /// Writable RAM size assumed until a node is identified.
    pub default_ram_write_size: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyAMA0".to_string(),
            baudrate: 2400,
            port_timeout: Duration::from_millis(250),
            wait_master_period: Duration::from_secs(2),
            master_event_timeout: Duration::from_secs(20),
            instant_reconnect_tries: 5,
            long_reconnect_period: Duration::from_secs(5),
            con_status_period: Duration::from_secs(1),
            send_frame_tries: 3,
            default_buffer_size: 3,
            default_eeprom_size: 20,
            default_ram_read_size: 20,
            default_ram_write_size: 20,
        }
    }
}
