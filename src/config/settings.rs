use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::modbus::protocol::SLAVE_ID_RANGE;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub worker: WorkerConfig,

    // Drive addressing
    pub slave_id: u8,

    // How long a caller waits for the worker to report a response
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: ParityConfig,
    pub stop_bits: StopBitsConfig,
    /// Read timeout applied to every blocking read on the port.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Idle wake-up period of the worker loop (drives background receive).
    pub poll_interval_ms: u64,
    /// Settling time between writing a request and reading its response.
    pub frame_gap_ms: u64,
    /// Upper bound on waiting for the loop to exit on disconnect.
    pub disconnect_wait_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBitsConfig {
    One,
    Two,
}

impl Default for SerialConfig {
    fn default() -> Self {
        let port = if cfg!(target_os = "windows") {
            "COM1"
        } else if cfg!(target_os = "macos") {
            "/dev/tty.usbserial-0001"
        } else {
            "/dev/ttyUSB0"
        };

        Self {
            port: port.to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            parity: ParityConfig::None,
            stop_bits: StopBitsConfig::One,
            timeout_ms: 500,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            frame_gap_ms: 5,
            disconnect_wait_ms: 2000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            worker: WorkerConfig::default(),
            slave_id: 1,
            response_timeout_ms: 3000,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn serial_parity(&self) -> serialport::Parity {
        match self.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        }
    }

    pub fn serial_stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            StopBitsConfig::One => serialport::StopBits::One,
            StopBitsConfig::Two => serialport::StopBits::Two,
        }
    }

    pub fn serial_data_bits(&self) -> Result<serialport::DataBits, ModbusError> {
        match self.data_bits {
            5 => Ok(serialport::DataBits::Five),
            6 => Ok(serialport::DataBits::Six),
            7 => Ok(serialport::DataBits::Seven),
            8 => Ok(serialport::DataBits::Eight),
            other => Err(ModbusError::ConfigError(format!(
                "Unsupported data bits: {}",
                other
            ))),
        }
    }

    /// Short form such as `115200 8N1`.
    pub fn describe(&self) -> String {
        let parity = match self.parity {
            ParityConfig::None => 'N',
            ParityConfig::Even => 'E',
            ParityConfig::Odd => 'O',
        };
        let stop = match self.stop_bits {
            StopBitsConfig::One => 1,
            StopBitsConfig::Two => 2,
        };
        format!("{} {}{}{}", self.baud_rate, self.data_bits, parity, stop)
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_gap(&self) -> Duration {
        Duration::from_millis(self.frame_gap_ms)
    }

    pub fn disconnect_wait(&self) -> Duration {
        Duration::from_millis(self.disconnect_wait_ms)
    }
}

impl ParityConfig {
    pub fn parse(value: &str) -> Result<Self, ModbusError> {
        match value.to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(ParityConfig::None),
            "e" | "even" => Ok(ParityConfig::Even),
            "o" | "odd" => Ok(ParityConfig::Odd),
            other => Err(ModbusError::ConfigError(format!("Unknown parity: {}", other))),
        }
    }
}

impl StopBitsConfig {
    pub fn parse(value: &str) -> Result<Self, ModbusError> {
        match value.trim() {
            "1" => Ok(StopBitsConfig::One),
            "2" => Ok(StopBitsConfig::Two),
            other => Err(ModbusError::ConfigError(format!("Unknown stop bits: {}", other))),
        }
    }
}

impl Config {
    /// Loads the config file if one is given, then applies command line overrides.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ModbusError> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(port) = matches.get_one::<String>("port") {
            config.serial.port = port.clone();
        }
        if let Some(baud) = matches.get_one::<String>("baud") {
            config.serial.baud_rate = baud
                .parse()
                .map_err(|_| ModbusError::ConfigError(format!("Invalid baud rate: {}", baud)))?;
        }
        if let Some(parity) = matches.get_one::<String>("parity") {
            config.serial.parity = ParityConfig::parse(parity)?;
        }
        if let Some(stop_bits) = matches.get_one::<String>("stop-bits") {
            config.serial.stop_bits = StopBitsConfig::parse(stop_bits)?;
        }
        if let Some(timeout) = matches.get_one::<String>("timeout") {
            config.serial.timeout_ms = timeout
                .parse()
                .map_err(|_| ModbusError::ConfigError(format!("Invalid timeout: {}", timeout)))?;
        }
        if let Some(slave) = matches.get_one::<String>("slave") {
            config.slave_id = crate::cli::parse_u8(slave)
                .map_err(|_| ModbusError::ConfigError(format!("Invalid slave id: {}", slave)))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration written to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.serial.port.trim().is_empty() {
            return Err(ModbusError::ConfigError("Serial port name is empty".to_string()));
        }
        if !SLAVE_ID_RANGE.contains(&self.slave_id) {
            return Err(ModbusError::ConfigError(format!(
                "Invalid slave id: {}. Must be 1-247",
                self.slave_id
            )));
        }
        if self.serial.baud_rate == 0 {
            return Err(ModbusError::ConfigError("Baud rate must be positive".to_string()));
        }
        self.serial.serial_data_bits()?;
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
