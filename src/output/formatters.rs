use chrono::{DateTime, Local, Utc};
use serde_json::json;
use std::fmt;

use crate::devices::motor::MotorStatus;
use crate::devices::registers::{get_register, RegisterType};
use crate::modbus::protocol::{FunctionCode, ModbusResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Tx => write!(f, "TX"),
            Direction::Rx => write!(f, "RX"),
        }
    }
}

pub trait ResponseFormatter: Send + Sync {
    fn format_response(&self, response: &ModbusResponse) -> String;
    fn format_raw(&self, direction: Direction, bytes: &[u8]) -> String;
    fn format_status(&self, status: &MotorStatus) -> String;

    /// Printed once before a session starts. Empty for machine-readable formats.
    fn format_header(&self) -> String {
        String::new()
    }
}

/// `01 03 02 00 2A`
pub fn spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

fn register_type_of(response: &ModbusResponse) -> RegisterType {
    if response.function_code == FunctionCode::ReadInput.code() {
        RegisterType::Input
    } else {
        RegisterType::Holding
    }
}

fn timestamp_of(response: &ModbusResponse) -> DateTime<Utc> {
    response.timestamp.unwrap_or_else(Utc::now)
}

pub struct ConsoleFormatter;

impl ResponseFormatter for ConsoleFormatter {
    fn format_response(&self, response: &ModbusResponse) -> String {
        let mut output = format!(
            "📡 Slave {} | FC 0x{:02X}",
            response.slave_id, response.function_code
        );

        if let Some(fault) = response.fault {
            output.push_str(&format!(
                " | ❌ {} (code {})\n",
                fault,
                response.fault_code()
            ));
            return output;
        }
        output.push('\n');

        let is_read = response.function_code == FunctionCode::ReadHolding.code()
            || response.function_code == FunctionCode::ReadInput.code();
        if !is_read {
            // Write echo: address then value/quantity.
            if let Some(address) = response.request_address() {
                output.push_str(&format!("  ✅ Write to 0x{:04X} acknowledged", address));
            } else {
                output.push_str("  ✅ Write acknowledged");
            }
            if let Some(value) = response.values.first() {
                output.push_str(&format!(" ({})", value));
            }
            output.push('\n');
            return output;
        }

        let start = response.request_address().unwrap_or(0);
        let reg_type = register_type_of(response);
        for (i, value) in response.values.iter().enumerate() {
            let address = start.wrapping_add(i as u16);
            output.push_str(&format!("  0x{:04X}: {:>5} (0x{:04X})", address, value, value));
            if let Some(def) = get_register(address, reg_type) {
                output.push_str(&format!("  {}", def.name));
                if def.count() == 2 {
                    if let Some(combined) = def.decode(&response.values[i..]) {
                        output.push_str(&format!(" = {}", combined));
                    }
                }
                if !def.unit.is_empty() {
                    output.push_str(&format!(" [{}]", def.unit));
                }
            }
            output.push('\n');
        }
        output
    }

    fn format_raw(&self, direction: Direction, bytes: &[u8]) -> String {
        let arrow = match direction {
            Direction::Tx => "➡️ ",
            Direction::Rx => "⬅️ ",
        };
        format!("{} {} ({} bytes): {}", arrow, direction, bytes.len(), spaced_hex(bytes))
    }

    fn format_status(&self, status: &MotorStatus) -> String {
        let mut output = String::from("🔹 Motor status:\n");
        output.push_str(&format!("  State:      {} (0x{:04X})\n", status.state, status.status_word));
        output.push_str(&format!("  Running:    {}\n", if status.is_running { "yes" } else { "no" }));
        output.push_str(&format!("  Position:   {} pulse\n", status.position));
        output.push_str(&format!("  Speed:      {} Step/s\n", status.speed));
        output.push_str(&format!("  Direction:  {}\n", status.direction));
        output.push_str(&format!("  Voltage:    {} V\n", status.voltage));
        match status.current_mode {
            Some(mode) => output.push_str(&format!("  Mode:       {:?}\n", mode)),
            None => output.push_str("  Mode:       -\n"),
        }
        if status.alarm_code != 0 {
            output.push_str(&format!(
                "  ⚠️  Alarm:    0x{:04X} {}\n",
                status.alarm_code, status.alarm_text
            ));
        }
        output
    }

    fn format_header(&self) -> String {
        format!("🚀 Modbus session - {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

pub struct JsonFormatter;

impl ResponseFormatter for JsonFormatter {
    fn format_response(&self, response: &ModbusResponse) -> String {
        let result = json!({
            "timestamp": timestamp_of(response).to_rfc3339(),
            "slave_id": response.slave_id,
            "function_code": response.function_code,
            "address": response.request_address(),
            "values": response.values,
            "fault_code": response.fault_code(),
            "fault": response.fault.map(|fault| fault.to_string()),
            "tx": hex::encode_upper(&response.raw_tx),
            "rx": hex::encode_upper(&response.raw_rx),
        });

        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    fn format_raw(&self, direction: Direction, bytes: &[u8]) -> String {
        json!({
            "timestamp": Utc::now().to_rfc3339(),
            "direction": direction.to_string(),
            "data": hex::encode_upper(bytes),
        })
        .to_string()
    }

    fn format_status(&self, status: &MotorStatus) -> String {
        serde_json::to_string_pretty(status).unwrap_or_default()
    }
}

pub struct HexFormatter;

impl HexFormatter {
    fn line(timestamp: DateTime<Utc>, direction: Direction, bytes: &[u8]) -> String {
        format!(
            "[{}] {} {}",
            timestamp.with_timezone(&Local).format("%H:%M:%S%.3f"),
            direction,
            spaced_hex(bytes)
        )
    }
}

impl ResponseFormatter for HexFormatter {
    fn format_response(&self, response: &ModbusResponse) -> String {
        let timestamp = timestamp_of(response);
        let mut output = Self::line(timestamp, Direction::Tx, &response.raw_tx);
        output.push('\n');
        output.push_str(&Self::line(timestamp, Direction::Rx, &response.raw_rx));
        if let Some(fault) = response.fault {
            output.push_str(&format!("  ; {}", fault));
        }
        output
    }

    fn format_raw(&self, direction: Direction, bytes: &[u8]) -> String {
        Self::line(Utc::now(), direction, bytes)
    }

    fn format_status(&self, status: &MotorStatus) -> String {
        format!(
            "status=0x{:04X} position=0x{:08X} speed=0x{:08X} alarm=0x{:04X}",
            status.status_word, status.position as u32, status.speed as u32, status.alarm_code
        )
    }
}

pub fn formatter_for(name: &str) -> Option<Box<dyn ResponseFormatter>> {
    match name {
        "console" => Some(Box::new(ConsoleFormatter)),
        "json" => Some(Box::new(JsonFormatter)),
        "hex" => Some(Box::new(HexFormatter)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::crc::append_crc;
    use crate::modbus::protocol::ModbusRequest;
    use crate::modbus::rtu::{build_frame, parse_response};

    fn read_response(request: &ModbusRequest, payload: &[u8]) -> ModbusResponse {
        let mut raw = vec![request.slave_id, request.function_code.code(), payload.len() as u8];
        raw.extend_from_slice(payload);
        let mut response = parse_response(&append_crc(&raw), request);
        response.raw_tx = build_frame(request).unwrap();
        response
    }

    #[test]
    fn test_spaced_hex() {
        assert_eq!(spaced_hex(&[0x01, 0x03, 0xAB]), "01 03 AB");
        assert_eq!(spaced_hex(&[]), "");
    }

    #[test]
    fn test_console_annotates_registers() {
        let request = ModbusRequest::read_input(1, 0x0021, 2);
        let response = read_response(&request, &[0xFF, 0xFF, 0xFC, 0x18]);
        let text = ConsoleFormatter.format_response(&response);

        assert!(text.contains("0x0021"));
        assert!(text.contains("Current position = -1000 [pulse]"));
        assert!(text.contains("0x0022"));
    }

    #[test]
    fn test_console_reports_exception() {
        let request = ModbusRequest::read_holding(1, 0x0200, 1);
        let mut response = parse_response(&append_crc(&[0x01, 0x83, 0x02]), &request);
        response.raw_tx = build_frame(&request).unwrap();
        let text = ConsoleFormatter.format_response(&response);

        assert!(text.contains("Illegal data address"));
        assert!(text.contains("code 2"));
    }

    #[test]
    fn test_json_output_is_parseable() {
        let request = ModbusRequest::read_holding(1, 0x0039, 1);
        let response = read_response(&request, &[0x00, 0x02]);
        let value: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_response(&response)).unwrap();

        assert_eq!(value["slave_id"], 1);
        assert_eq!(value["address"], 0x0039);
        assert_eq!(value["values"][0], 2);
        assert_eq!(value["fault_code"], 0);
        assert!(value["fault"].is_null());
        assert_eq!(value["tx"], "0103003900015407");
    }

    #[test]
    fn test_hex_formatter_lines() {
        let line = HexFormatter.format_raw(Direction::Tx, &[0x01, 0x06]);
        assert!(line.ends_with("TX 01 06"));

        let request = ModbusRequest::read_holding(1, 0x0000, 1);
        let response = ModbusResponse::timeout(&request, build_frame(&request).unwrap());
        let text = HexFormatter.format_response(&response);
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("timeout"));
    }

    #[test]
    fn test_header_only_for_console() {
        assert!(ConsoleFormatter.format_header().starts_with("🚀 Modbus session"));
        assert!(JsonFormatter.format_header().is_empty());
        assert!(HexFormatter.format_header().is_empty());
    }

    #[test]
    fn test_formatter_lookup() {
        assert!(formatter_for("json").is_some());
        assert!(formatter_for("csv").is_none());
    }
}
