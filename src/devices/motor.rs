//! Motor operations expressed as Modbus requests, and decoding of the drive's replies.
//!
//! Nothing in here touches the serial port. Multi-step operations return the
//! requests in the order they must be executed; hand them to
//! `ModbusSession::run_sequence` so each one is acknowledged before the next is sent.

use serde::Serialize;
use std::fmt;

use super::error_codes::error_text;
use crate::modbus::protocol::{FunctionCode, ModbusRequest, ModbusResponse, ResponseFault};
use crate::modbus::values::{combine_32bit, split_32bit};

pub const REG_SAVE_PARAMS: u16 = 0x0008;
pub const REG_RESTORE_DEFAULTS: u16 = 0x000B;
pub const REG_STATUS_BLOCK: u16 = 0x0017;
pub const STATUS_BLOCK_LEN: u16 = 16;
pub const REG_RUN_MODE: u16 = 0x0039;
pub const REG_SET_ZERO: u16 = 0x0047;
pub const REG_SET_ORIGIN: u16 = 0x0048;
pub const REG_CONTROL_WORD: u16 = 0x0051;
pub const REG_DIRECTION: u16 = 0x0052;
pub const REG_TARGET_POSITION: u16 = 0x0053;
pub const REG_TARGET_SPEED: u16 = 0x0055;

const SAVE_PARAMS_KEY: u16 = 0x7376;
const RESTORE_DEFAULTS_KEY: u16 = 0x6C64;
const SET_ORIGIN_KEY: u16 = 0x5348;
const SET_ZERO_KEY: u16 = 0x535A;

/// Control word values written to `REG_CONTROL_WORD`.
pub mod control {
    pub const DISABLE: u16 = 0x0000;
    pub const QUICK_STOP: u16 = 0x0002;
    pub const STARTUP: u16 = 0x0006;
    pub const ENABLE: u16 = 0x0007;
    pub const RUN: u16 = 0x000F;
    pub const TRIGGER_ABSOLUTE: u16 = 0x001F;
    pub const PREPARE_RELATIVE: u16 = 0x004F;
    pub const TRIGGER_RELATIVE: u16 = 0x005F;
    pub const CLEAR_FAULT: u16 = 0x0080;
}

const STATUS_FAULT_BIT: u16 = 0x0008;
const STATUS_RUNNING_BIT: u16 = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotorState {
    Unknown,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    QuickStop,
    Fault,
}

impl MotorState {
    pub fn from_status_word(word: u16) -> Self {
        if word & STATUS_FAULT_BIT != 0 {
            return MotorState::Fault;
        }
        match word {
            0x0050 => MotorState::SwitchOnDisabled,
            0x0031 => MotorState::ReadyToSwitchOn,
            0x0033 => MotorState::SwitchedOn,
            0x0037 => MotorState::OperationEnabled,
            0x0017 => MotorState::QuickStop,
            _ => MotorState::Unknown,
        }
    }
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MotorState::Unknown => "Unknown",
            MotorState::SwitchOnDisabled => "Switch on disabled",
            MotorState::ReadyToSwitchOn => "Ready to switch on",
            MotorState::SwitchedOn => "Switched on",
            MotorState::OperationEnabled => "Operation enabled",
            MotorState::QuickStop => "Quick stop",
            MotorState::Fault => "Fault",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    Position = 1,
    Speed = 2,
    Homing = 3,
    PulseInput = 4,
}

impl RunMode {
    pub fn from_register(value: u16) -> Option<Self> {
        match value {
            1 => Some(RunMode::Position),
            2 => Some(RunMode::Speed),
            3 => Some(RunMode::Homing),
            4 => Some(RunMode::PulseInput),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "position" | "1" => Some(RunMode::Position),
            "speed" | "2" => Some(RunMode::Speed),
            "homing" | "3" => Some(RunMode::Homing),
            "pulse" | "pulse-input" | "4" => Some(RunMode::PulseInput),
            _ => None,
        }
    }
}

/// Snapshot decoded from the 16 input registers starting at 0x0017.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorStatus {
    pub status_word: u16,
    pub state: MotorState,
    pub position: i64,
    /// Step/s, already divided by ten.
    pub speed: i64,
    pub voltage: u16,
    pub current_mode: Option<RunMode>,
    pub direction: u16,
    pub alarm_code: u16,
    pub alarm_text: String,
    pub is_running: bool,
}

impl MotorStatus {
    pub fn from_registers(values: &[u16]) -> Option<Self> {
        if values.len() < STATUS_BLOCK_LEN as usize {
            return None;
        }

        // Offsets are relative to 0x0017. 0x18..0x19 (digital inputs) and
        // 0x1A..0x1D (reserved) are skipped, as is the error register at 0x25.
        let status_word = values[8];
        let alarm_code = values[15];
        Some(Self {
            status_word,
            state: MotorState::from_status_word(status_word),
            position: combine_32bit(values[10], values[11], true),
            speed: combine_32bit(values[12], values[13], false) / 10,
            voltage: values[0],
            current_mode: RunMode::from_register(values[7]),
            direction: values[9],
            alarm_code,
            alarm_text: if alarm_code != 0 {
                error_text(alarm_code)
            } else {
                String::new()
            },
            is_running: status_word & STATUS_RUNNING_BIT != 0,
        })
    }
}

/// What a response means for the motor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MotorEvent {
    StatusUpdated(MotorStatus),
    /// `(address, value)` pairs from a holding register read.
    ParamsRead(Vec<(u16, u16)>),
    OperationDone { ok: bool, message: String },
    /// A status read that returned too few registers to decode.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct MotorService {
    slave_id: u8,
}

impl MotorService {
    pub fn new(slave_id: u8) -> Self {
        Self { slave_id }
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn refresh_status(&self) -> ModbusRequest {
        ModbusRequest::read_input(self.slave_id, REG_STATUS_BLOCK, STATUS_BLOCK_LEN)
    }

    // State machine

    pub fn startup(&self) -> ModbusRequest {
        self.control_word(control::STARTUP)
    }

    pub fn enable(&self) -> ModbusRequest {
        self.control_word(control::ENABLE)
    }

    pub fn run(&self) -> ModbusRequest {
        self.control_word(control::RUN)
    }

    /// Decelerates back to the enabled state.
    pub fn stop(&self) -> ModbusRequest {
        self.control_word(control::ENABLE)
    }

    pub fn quick_stop(&self) -> ModbusRequest {
        self.control_word(control::QUICK_STOP)
    }

    pub fn disable(&self) -> ModbusRequest {
        self.control_word(control::DISABLE)
    }

    pub fn clear_fault(&self) -> ModbusRequest {
        self.control_word(control::CLEAR_FAULT)
    }

    // Motion

    pub fn move_relative(&self, position: i64) -> Vec<ModbusRequest> {
        vec![
            self.write_32bit(REG_TARGET_POSITION, position),
            self.control_word(control::PREPARE_RELATIVE),
            self.control_word(control::TRIGGER_RELATIVE),
        ]
    }

    pub fn move_absolute(&self, position: i64) -> Vec<ModbusRequest> {
        vec![
            self.write_32bit(REG_TARGET_POSITION, position),
            self.control_word(control::RUN),
            self.control_word(control::TRIGGER_ABSOLUTE),
        ]
    }

    pub fn set_speed(&self, speed: i64, direction: u16) -> Vec<ModbusRequest> {
        vec![
            self.write_single(REG_DIRECTION, direction),
            self.write_32bit(REG_TARGET_SPEED, speed),
            self.control_word(control::RUN),
        ]
    }

    pub fn start_homing(&self) -> Vec<ModbusRequest> {
        vec![
            self.control_word(control::RUN),
            self.control_word(control::TRIGGER_ABSOLUTE),
        ]
    }

    // Parameters

    pub fn read_param(&self, address: u16, count: u16) -> ModbusRequest {
        ModbusRequest::read_holding(self.slave_id, address, count)
    }

    pub fn write_param(&self, address: u16, value: u16) -> ModbusRequest {
        self.write_single(address, value)
    }

    pub fn write_param_32bit(&self, address: u16, value: i64) -> ModbusRequest {
        self.write_32bit(address, value)
    }

    /// Persists all parameters to EEPROM.
    pub fn save_params(&self) -> ModbusRequest {
        self.write_single(REG_SAVE_PARAMS, SAVE_PARAMS_KEY)
    }

    pub fn restore_defaults(&self) -> ModbusRequest {
        self.write_single(REG_RESTORE_DEFAULTS, RESTORE_DEFAULTS_KEY)
    }

    pub fn set_run_mode(&self, mode: RunMode) -> ModbusRequest {
        self.write_single(REG_RUN_MODE, mode as u16)
    }

    pub fn set_origin(&self) -> ModbusRequest {
        self.write_single(REG_SET_ORIGIN, SET_ORIGIN_KEY)
    }

    pub fn set_zero(&self) -> ModbusRequest {
        self.write_single(REG_SET_ZERO, SET_ZERO_KEY)
    }

    pub fn handle_response(&self, resp: &ModbusResponse) -> MotorEvent {
        if let Some(fault) = resp.fault {
            return MotorEvent::OperationDone {
                ok: false,
                message: Self::format_fault(fault),
            };
        }

        if resp.function_code == FunctionCode::ReadInput.code() {
            match MotorStatus::from_registers(&resp.values) {
                Some(status) => MotorEvent::StatusUpdated(status),
                None => MotorEvent::Ignored,
            }
        } else if resp.function_code == FunctionCode::ReadHolding.code() {
            let start = resp.request_address().unwrap_or(0);
            MotorEvent::ParamsRead(
                resp.values
                    .iter()
                    .enumerate()
                    .map(|(i, value)| (start.wrapping_add(i as u16), *value))
                    .collect(),
            )
        } else {
            MotorEvent::OperationDone {
                ok: true,
                message: "Operation succeeded".to_string(),
            }
        }
    }

    fn format_fault(fault: ResponseFault) -> String {
        match fault {
            ResponseFault::CrcMismatch => "CRC check failed".to_string(),
            ResponseFault::Timeout => "Communication timeout".to_string(),
            ResponseFault::FrameTooShort => "Incomplete response frame".to_string(),
            ResponseFault::Exception(_) => fault.to_string(),
        }
    }

    fn control_word(&self, value: u16) -> ModbusRequest {
        self.write_single(REG_CONTROL_WORD, value)
    }

    fn write_single(&self, address: u16, value: u16) -> ModbusRequest {
        ModbusRequest::write_single(self.slave_id, address, value)
    }

    fn write_32bit(&self, address: u16, value: i64) -> ModbusRequest {
        let (high, low) = split_32bit(value);
        ModbusRequest::write_multiple(self.slave_id, address, vec![high, low])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::crc::append_crc;
    use crate::modbus::rtu::{build_frame, parse_response};

    fn status_registers() -> Vec<u16> {
        let mut regs = vec![0u16; 16];
        regs[0] = 24; // voltage
        regs[7] = 1; // position mode
        regs[8] = 0x1037; // operation enabled + running
        regs[9] = 1; // forward
        regs[10] = 0xFFFF; // position -1000
        regs[11] = 0xFC18;
        regs[12] = 0x0000; // speed 2500 (x10)
        regs[13] = 25_000;
        regs[15] = 0x7121; // stall alarm
        regs
    }

    #[test]
    fn test_state_decoding() {
        assert_eq!(MotorState::from_status_word(0x0050), MotorState::SwitchOnDisabled);
        assert_eq!(MotorState::from_status_word(0x0031), MotorState::ReadyToSwitchOn);
        assert_eq!(MotorState::from_status_word(0x0033), MotorState::SwitchedOn);
        assert_eq!(MotorState::from_status_word(0x0037), MotorState::OperationEnabled);
        assert_eq!(MotorState::from_status_word(0x0017), MotorState::QuickStop);
        assert_eq!(MotorState::from_status_word(0x0008), MotorState::Fault);
        assert_eq!(MotorState::from_status_word(0x0058), MotorState::Fault);
        assert_eq!(MotorState::from_status_word(0x1234), MotorState::Unknown);
    }

    #[test]
    fn test_status_from_registers() {
        let status = MotorStatus::from_registers(&status_registers()).unwrap();

        assert_eq!(status.voltage, 24);
        assert_eq!(status.current_mode, Some(RunMode::Position));
        assert_eq!(status.status_word, 0x1037);
        assert_eq!(status.state, MotorState::Unknown);
        assert!(status.is_running);
        assert_eq!(status.direction, 1);
        assert_eq!(status.position, -1000);
        assert_eq!(status.speed, 2500);
        assert_eq!(status.alarm_code, 0x7121);
        assert_eq!(status.alarm_text, "Stall alarm");

        assert!(MotorStatus::from_registers(&[0u16; 15]).is_none());
    }

    #[test]
    fn test_control_word_requests() {
        let motor = MotorService::new(2);
        let startup = motor.startup();
        assert_eq!(startup.slave_id, 2);
        assert_eq!(startup.function_code, FunctionCode::WriteSingle);
        assert_eq!(startup.address, REG_CONTROL_WORD);
        assert_eq!(startup.values, vec![0x0006]);

        assert_eq!(motor.enable().values, vec![0x0007]);
        assert_eq!(motor.run().values, vec![0x000F]);
        assert_eq!(motor.stop().values, vec![0x0007]);
        assert_eq!(motor.quick_stop().values, vec![0x0002]);
        assert_eq!(motor.disable().values, vec![0x0000]);
        assert_eq!(motor.clear_fault().values, vec![0x0080]);
    }

    #[test]
    fn test_move_relative_sequence() {
        let motor = MotorService::new(1);
        let steps = motor.move_relative(-1000);

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].function_code, FunctionCode::WriteMultiple);
        assert_eq!(steps[0].address, REG_TARGET_POSITION);
        assert_eq!(steps[0].values, vec![0xFFFF, 0xFC18]);
        assert_eq!(steps[0].count, 2);
        assert_eq!(steps[1].values, vec![0x004F]);
        assert_eq!(steps[2].values, vec![0x005F]);
    }

    #[test]
    fn test_speed_and_homing_sequences() {
        let motor = MotorService::new(1);
        let speed = motor.set_speed(100_000, 1);
        assert_eq!(speed[0].address, REG_DIRECTION);
        assert_eq!(speed[0].values, vec![1]);
        assert_eq!(speed[1].address, REG_TARGET_SPEED);
        assert_eq!(speed[1].values, vec![0x0001, 0x86A0]);
        assert_eq!(speed[2].values, vec![control::RUN]);

        let homing = motor.start_homing();
        assert_eq!(
            homing.iter().map(|r| r.values[0]).collect::<Vec<_>>(),
            vec![0x000F, 0x001F]
        );

        let absolute = motor.move_absolute(500);
        assert_eq!(absolute[0].values, vec![0, 500]);
        assert_eq!(absolute[2].values, vec![0x001F]);
    }

    #[test]
    fn test_parameter_requests() {
        let motor = MotorService::new(1);
        let save = motor.save_params();
        assert_eq!((save.address, save.values[0]), (0x0008, 0x7376));
        let restore = motor.restore_defaults();
        assert_eq!((restore.address, restore.values[0]), (0x000B, 0x6C64));
        let mode = motor.set_run_mode(RunMode::Speed);
        assert_eq!((mode.address, mode.values[0]), (0x0039, 2));
        assert_eq!(motor.set_origin().values, vec![0x5348]);
        assert_eq!(motor.set_zero().values, vec![0x535A]);
        assert_eq!(motor.read_param(0x005B, 2).count, 2);
    }

    #[test]
    fn test_handle_status_response() {
        let motor = MotorService::new(1);
        let request = motor.refresh_status();

        let mut raw = vec![0x01, 0x04, 0x20];
        for reg in status_registers() {
            raw.extend_from_slice(&reg.to_be_bytes());
        }
        let resp = parse_response(&append_crc(&raw), &request);

        match motor.handle_response(&resp) {
            MotorEvent::StatusUpdated(status) => assert_eq!(status.position, -1000),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_handle_param_response_uses_sent_address() {
        let motor = MotorService::new(1);
        let request = motor.read_param(0x005B, 2);
        let mut resp = parse_response(
            &append_crc(&[0x01, 0x03, 0x04, 0x00, 0x00, 0x00, 0xFA]),
            &request,
        );
        resp.raw_tx = build_frame(&request).unwrap();

        assert_eq!(
            motor.handle_response(&resp),
            MotorEvent::ParamsRead(vec![(0x005B, 0), (0x005C, 250)])
        );
    }

    #[test]
    fn test_handle_fault_and_write_responses() {
        let motor = MotorService::new(1);
        let request = motor.startup();

        let timeout = ModbusResponse::timeout(&request, Vec::new());
        assert_eq!(
            motor.handle_response(&timeout),
            MotorEvent::OperationDone {
                ok: false,
                message: "Communication timeout".to_string()
            }
        );

        let exception = parse_response(&append_crc(&[0x01, 0x86, 0x02]), &request);
        match motor.handle_response(&exception) {
            MotorEvent::OperationDone { ok, message } => {
                assert!(!ok);
                assert!(message.contains("Illegal data address"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let echo = parse_response(&build_frame(&request).unwrap(), &request);
        assert!(matches!(
            motor.handle_response(&echo),
            MotorEvent::OperationDone { ok: true, .. }
        ));
    }
}
