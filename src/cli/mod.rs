pub mod commands;

use clap::{Arg, ArgAction, Command};

use crate::utils::error::ModbusError;

pub const MOTOR_ACTIONS: [&str; 16] = [
    "startup",
    "enable",
    "run",
    "stop",
    "quick-stop",
    "disable",
    "clear-fault",
    "move-rel",
    "move-abs",
    "speed",
    "home",
    "mode",
    "save",
    "restore",
    "origin",
    "zero",
];

fn split_radix(value: &str) -> (&str, u32) {
    let trimmed = value.trim();
    match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(digits) => (digits, 16),
        None => (trimmed, 10),
    }
}

/// Accepts decimal or `0x`-prefixed hexadecimal.
pub fn parse_u8(value: &str) -> Result<u8, ModbusError> {
    let (digits, radix) = split_radix(value);
    u8::from_str_radix(digits, radix)
        .map_err(|_| ModbusError::InvalidRequest(format!("Invalid 8-bit value: {}", value)))
}

/// Accepts decimal or `0x`-prefixed hexadecimal.
pub fn parse_u16(value: &str) -> Result<u16, ModbusError> {
    let (digits, radix) = split_radix(value);
    u16::from_str_radix(digits, radix)
        .map_err(|_| ModbusError::InvalidRequest(format!("Invalid 16-bit value: {}", value)))
}

/// Signed decimal, or `0x`-prefixed hexadecimal taken as an unsigned bit pattern.
pub fn parse_i64(value: &str) -> Result<i64, ModbusError> {
    let (digits, radix) = split_radix(value);
    i64::from_str_radix(digits, radix)
        .map_err(|_| ModbusError::InvalidRequest(format!("Invalid number: {}", value)))
}

/// `"1,2,0x10"` -> `[1, 2, 16]`
pub fn parse_u16_list(value: &str) -> Result<Vec<u16>, ModbusError> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(parse_u16)
        .collect()
}

/// Hex bytes with optional spaces, commas or `0x` prefixes: `"01 03 00 00"`, `"0x01,0x03"`, `"0103"`.
pub fn parse_hex_bytes(value: &str) -> Result<Vec<u8>, ModbusError> {
    let compact: String = value
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|part| {
            part.strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part)
        })
        .collect();
    if compact.is_empty() {
        return Err(ModbusError::InvalidRequest("No bytes given".to_string()));
    }
    hex::decode(&compact)
        .map_err(|e| ModbusError::InvalidRequest(format!("Invalid hex data '{}': {}", value, e)))
}

fn address_arg() -> Arg {
    Arg::new("address")
        .long("address")
        .short('a')
        .value_name("ADDR")
        .required(true)
        .help("Register address (decimal or 0x hex)")
}

pub fn build_cli() -> Command {
    Command::new("nimotion")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Modbus-RTU debugging tool for integrated stepper drives")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .global(true)
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .value_name("PORT")
                .global(true)
                .help("Serial port, e.g. /dev/ttyUSB0 or COM3"),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .short('b')
                .value_name("RATE")
                .global(true)
                .help("Baud rate"),
        )
        .arg(
            Arg::new("parity")
                .long("parity")
                .value_name("PARITY")
                .global(true)
                .help("none, even or odd"),
        )
        .arg(
            Arg::new("stop-bits")
                .long("stop-bits")
                .value_name("BITS")
                .global(true)
                .help("1 or 2"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .short('t')
                .value_name("MS")
                .global(true)
                .help("Serial read timeout in milliseconds"),
        )
        .arg(
            Arg::new("slave")
                .long("slave")
                .short('s')
                .value_name("ID")
                .global(true)
                .help("Slave id (1-247)"),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .short('f')
                .value_name("FORMAT")
                .value_parser(["console", "json", "hex"])
                .default_value("console")
                .global(true)
                .help("Output format"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Enable debug logging"),
        )
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(
            Command::new("read")
                .about("Read holding (or input) registers")
                .arg(address_arg())
                .arg(
                    Arg::new("count")
                        .long("count")
                        .short('n')
                        .value_name("N")
                        .default_value("1")
                        .help("Number of registers"),
                )
                .arg(
                    Arg::new("input")
                        .long("input")
                        .short('i')
                        .action(ArgAction::SetTrue)
                        .help("Read input registers (0x04) instead of holding registers"),
                ),
        )
        .subcommand(
            Command::new("write")
                .about("Write a single holding register")
                .arg(address_arg())
                .arg(
                    Arg::new("value")
                        .long("value")
                        .value_name("VALUE")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("write32")
                .about("Write a 32-bit value across two registers (high word first)")
                .arg(address_arg())
                .arg(
                    Arg::new("value")
                        .long("value")
                        .value_name("VALUE")
                        .required(true)
                        .allow_negative_numbers(true),
                )
                .arg(
                    Arg::new("signed")
                        .long("signed")
                        .action(ArgAction::SetTrue)
                        .help("Treat the value as a signed 32-bit integer"),
                ),
        )
        .subcommand(
            Command::new("write-multi")
                .about("Write consecutive holding registers")
                .arg(address_arg())
                .arg(
                    Arg::new("values")
                        .long("values")
                        .value_name("A,B,...")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("raw")
                .about("Send raw bytes and print whatever comes back")
                .arg(
                    Arg::new("hex")
                        .long("hex")
                        .value_name("BYTES")
                        .required(true)
                        .help("Bytes to send, e.g. \"01 03 00 00 00 01 84 0A\""),
                )
                .arg(
                    Arg::new("listen")
                        .long("listen")
                        .value_name("MS")
                        .default_value("500")
                        .help("How long to collect incoming data, 0 waits for Ctrl-C"),
                ),
        )
        .subcommand(Command::new("status").about("Read and decode the motor status block"))
        .subcommand(
            Command::new("motor")
                .about("Run a motor operation")
                .arg(
                    Arg::new("action")
                        .required(true)
                        .value_parser(MOTOR_ACTIONS)
                        .help("Operation to run"),
                )
                .arg(
                    Arg::new("position")
                        .long("position")
                        .value_name("PULSES")
                        .allow_negative_numbers(true)
                        .help("Target for move-rel/move-abs"),
                )
                .arg(
                    Arg::new("speed")
                        .long("speed")
                        .value_name("STEP/S")
                        .help("Target for speed"),
                )
                .arg(
                    Arg::new("direction")
                        .long("direction")
                        .value_name("DIR")
                        .default_value("0")
                        .help("0 or 1, used by speed"),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .value_name("MODE")
                        .help("position, speed, homing or pulse"),
                ),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write a configuration file with the effective settings")
                .arg(Arg::new("path").required(true).value_name("PATH")),
        )
}
