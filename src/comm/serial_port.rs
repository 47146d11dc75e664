use log::{debug, error, info};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::Instant;

use crate::config::SerialConfig;
use crate::utils::error::ModbusError;

/// Byte channel the worker drives. Not thread safe by contract: only the
/// worker's loop thread touches it while the loop is running.
pub trait SerialChannel: Send {
    fn open(&mut self, config: &SerialConfig) -> Result<(), ModbusError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Returns the number of bytes accepted by the port.
    fn write(&mut self, data: &[u8]) -> Result<usize, ModbusError>;

    /// Blocks until `size` bytes arrived or the read timeout elapsed; may return fewer.
    fn read(&mut self, size: usize) -> Result<Vec<u8>, ModbusError>;

    /// Everything currently buffered, without waiting.
    fn read_all(&mut self) -> Result<Vec<u8>, ModbusError>;

    fn flush_input(&mut self) -> Result<(), ModbusError>;
}

#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

pub fn list_ports() -> Result<Vec<PortInfo>, ModbusError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb_info) => PortInfo {
                name: port.port_name,
                manufacturer: usb_info.manufacturer,
                serial_number: usb_info.serial_number,
            },
            _ => PortInfo {
                name: port.port_name,
                manufacturer: None,
                serial_number: None,
            },
        })
        .collect())
}

/// `SerialChannel` backed by a real port.
#[derive(Default)]
pub struct SerialPortChannel {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, ModbusError> {
        self.port.as_mut().ok_or(ModbusError::PortNotOpen)
    }
}

impl SerialChannel for SerialPortChannel {
    fn open(&mut self, config: &SerialConfig) -> Result<(), ModbusError> {
        self.close();

        info!("Opening serial port {} ({})", config.port, config.describe());
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(config.serial_data_bits()?)
            .parity(config.serial_parity())
            .stop_bits(config.serial_stop_bits())
            .timeout(config.timeout())
            .open()
            .map_err(|e| {
                error!("Failed to open serial port {}: {}", config.port, e);
                ModbusError::ConnectionError(format!("Failed to open port {}: {}", config.port, e))
            })?;

        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ModbusError> {
        let port = self.port_mut()?;
        let written = port
            .write(data)
            .map_err(|e| ModbusError::CommunicationError(format!("Write failed: {}", e)))?;
        port.flush()
            .map_err(|e| ModbusError::CommunicationError(format!("Flush failed: {}", e)))?;
        Ok(written)
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>, ModbusError> {
        let port = self.port_mut()?;
        let deadline = Instant::now() + port.timeout();
        let mut received = Vec::with_capacity(size);
        let mut buffer = vec![0u8; size];

        while received.len() < size {
            let remaining = size - received.len();
            match port.read(&mut buffer[..remaining]) {
                Ok(0) => {}
                Ok(n) => received.extend_from_slice(&buffer[..n]),
                Err(ref e) if e.kind() == ErrorKind::TimedOut => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(ModbusError::CommunicationError(format!("Read failed: {}", e)));
                }
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        debug!("Read {} of {} requested bytes", received.len(), size);
        Ok(received)
    }

    fn read_all(&mut self) -> Result<Vec<u8>, ModbusError> {
        let port = self.port_mut()?;
        let available = port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; available];
        let n = port
            .read(&mut buffer)
            .map_err(|e| ModbusError::CommunicationError(format!("Read failed: {}", e)))?;
        buffer.truncate(n);
        Ok(buffer)
    }

    fn flush_input(&mut self) -> Result<(), ModbusError> {
        if let Some(port) = self.port.as_mut() {
            port.clear(ClearBuffer::Input)?;
        }
        Ok(())
    }
}
