pub mod serial_port;
pub mod worker;

#[cfg(test)]
pub(crate) mod mock_channel;

pub use serial_port::{list_ports, PortInfo, SerialChannel, SerialPortChannel};
pub use worker::{CommEvent, CommWorker};
