//! Register map of the integrated stepper drive (open-loop firmware).
//!
//! Used for annotation only; the protocol layer never checks these bounds.

use serde::Serialize;

use crate::modbus::values::combine_32bit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegisterType {
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataType {
    Uint16,
    Int16,
    Uint32,
    Int32,
}

impl DataType {
    /// Number of 16-bit registers the value occupies.
    pub const fn width(self) -> u16 {
        match self {
            DataType::Uint16 | DataType::Int16 => 1,
            DataType::Uint32 | DataType::Int32 => 2,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, DataType::Int16 | DataType::Int32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisterDef {
    pub address: u16,
    pub name: &'static str,
    pub reg_type: RegisterType,
    pub data_type: DataType,
    pub unit: &'static str,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub default: Option<i64>,
    pub writable: bool,
    pub restart_required: bool,
}

impl RegisterDef {
    const fn new(
        address: u16,
        name: &'static str,
        reg_type: RegisterType,
        data_type: DataType,
    ) -> Self {
        Self {
            address,
            name,
            reg_type,
            data_type,
            unit: "",
            min: None,
            max: None,
            default: None,
            writable: matches!(reg_type, RegisterType::Holding),
            restart_required: false,
        }
    }

    const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = unit;
        self
    }

    const fn range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    const fn default_value(mut self, value: i64) -> Self {
        self.default = Some(value);
        self
    }

    const fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    const fn restart(mut self) -> Self {
        self.restart_required = true;
        self
    }

    pub const fn count(&self) -> u16 {
        self.data_type.width()
    }

    /// Interprets the leading registers of `words` according to this definition.
    pub fn decode(&self, words: &[u16]) -> Option<i64> {
        match self.data_type {
            DataType::Uint16 => words.first().map(|w| *w as i64),
            DataType::Int16 => words.first().map(|w| *w as i16 as i64),
            DataType::Uint32 | DataType::Int32 => match words {
                [high, low, ..] => Some(combine_32bit(*high, *low, self.data_type.is_signed())),
                _ => None,
            },
        }
    }

    pub fn in_range(&self, value: i64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

const fn holding(address: u16, name: &'static str, data_type: DataType) -> RegisterDef {
    RegisterDef::new(address, name, RegisterType::Holding, data_type)
}

const fn input(address: u16, name: &'static str, data_type: DataType) -> RegisterDef {
    RegisterDef::new(address, name, RegisterType::Input, data_type).read_only()
}

use DataType::{Int32, Uint16, Uint32};

pub const HOLDING_REGISTERS: &[RegisterDef] = &[
    // Communication
    holding(0x0000, "Slave address", Uint16).range(1, 247).default_value(1).restart(),
    holding(0x0001, "Baud rate", Uint16).range(0, 9).default_value(5).restart(),
    holding(0x0002, "Data format", Uint16).range(0, 3).default_value(2).restart(),
    holding(0x0003, "Response delay", Uint16).unit("ms").range(0, 10000).default_value(0),
    // System
    holding(0x0008, "Save all parameters", Uint16),
    holding(0x000B, "Restore defaults", Uint16).restart(),
    // Motor electrical
    holding(0x000E, "Phase resistance", Uint32).unit("mOhm").default_value(290).restart(),
    holding(0x0010, "Phase inductance", Uint32).unit("uH").default_value(1770).restart(),
    holding(0x0012, "Back-EMF constant", Uint32).unit("mV/Hz").default_value(46).restart(),
    holding(0x0014, "Supply voltage", Uint16).unit("V").default_value(24).restart(),
    // Currents
    holding(0x0015, "Deceleration current", Uint16).unit("mA").range(0, 10000).default_value(1000),
    holding(0x0016, "Idle current", Uint16).unit("mA").range(0, 10000).default_value(500),
    holding(0x0017, "Acceleration current", Uint16).unit("mA").range(0, 10000).default_value(1000),
    holding(0x0018, "Running current", Uint16).unit("mA").range(0, 10000).default_value(1000),
    holding(0x0019, "Overload current", Uint16).unit("100mA").range(0, 100).default_value(40),
    holding(0x001A, "Microstep", Uint16).range(0, 7).default_value(7),
    holding(0x001F, "Low speed optimization", Uint16).range(0, 1).default_value(1),
    // Digital I/O
    holding(0x002C, "Input special function", Uint32).default_value(0),
    holding(0x002E, "Input polarity", Uint16).default_value(0),
    holding(0x002F, "Input pull-up enable", Uint16).default_value(0),
    holding(0x0030, "Input trigger mode", Uint32).default_value(69905),
    holding(0x0034, "I/O port direction", Uint16).default_value(0),
    holding(0x0035, "Fail-safe output enable", Uint16).default_value(0),
    holding(0x0036, "Fail-safe output preset", Uint16).default_value(0),
    holding(0x0037, "Digital output", Uint32).default_value(0),
    // Motion configuration
    holding(0x0039, "Run mode", Uint16).range(1, 4).default_value(1),
    holding(0x003A, "Stop behaviour", Uint16).range(0, 1).default_value(1),
    holding(0x003B, "Quick stop behaviour", Uint16).range(0, 1).default_value(1),
    holding(0x003C, "Fault stop behaviour", Uint16).range(0, 1).default_value(0),
    holding(0x0043, "Stall detection threshold", Uint32).unit("100mA").range(0, 100).default_value(80),
    holding(0x0047, "Set zero", Uint16),
    holding(0x0048, "Set origin", Uint16),
    // Motion control
    holding(0x0051, "Control word", Uint16),
    holding(0x0052, "Direction", Uint16).range(0, 1).default_value(0),
    holding(0x0053, "Target position", Int32).unit("pulse").default_value(0),
    holding(0x0055, "Target speed", Uint32).unit("Step/s").range(0, 15610).default_value(100),
    holding(0x0057, "Position lower limit", Int32).unit("pulse").default_value(0),
    holding(0x0059, "Position upper limit", Int32).unit("pulse").default_value(0),
    holding(0x005B, "Maximum speed", Uint32).unit("Step/s").range(0, 15610).default_value(250),
    holding(0x005D, "Minimum speed", Uint32).unit("Step/s").range(0, 1000).default_value(16),
    holding(0x005F, "Acceleration", Uint32).unit("Step/s^2").range(1, 59590).default_value(1000),
    holding(0x0061, "Deceleration", Uint32).unit("Step/s^2").range(1, 59590).default_value(1000),
    // Homing
    holding(0x0069, "Home offset", Int32).unit("pulse").default_value(0),
    holding(0x006B, "Homing method", Uint16).range(17, 31).default_value(17),
    holding(0x006C, "Switch search speed", Uint32).unit("Step/s").range(0, 15610).default_value(100),
    holding(0x006E, "Zero search speed", Uint32).unit("Step/s").range(0, 15610).default_value(100),
    holding(0x0072, "Return to zero after homing", Uint16).range(0, 1).default_value(0),
    // Maintenance
    holding(0x0073, "Clear error memory", Uint16),
    holding(0x0074, "Hardware self-test", Uint16),
    holding(0x0075, "User program control", Uint16).range(0, 3).default_value(0),
    holding(0x0076, "User program status", Uint16).default_value(0).read_only(),
    holding(0x007B, "Voltage/current mode", Uint16).range(0, 1).default_value(0).restart(),
];

pub const INPUT_REGISTERS: &[RegisterDef] = &[
    // Device information
    input(0x0000, "Vendor id", Uint32),
    input(0x0002, "Serial number", Uint32),
    input(0x0004, "Hardware version", Uint32),
    input(0x000A, "Software version", Uint32),
    input(0x000C, "Operating hours", Uint32).unit("h"),
    // Drive state
    input(0x0016, "Driver circuit state", Uint16),
    input(0x0017, "Input voltage", Uint16).unit("V"),
    input(0x0018, "Digital inputs", Uint32),
    input(0x001E, "Current run mode", Uint16),
    input(0x001F, "Status word", Uint16),
    input(0x0020, "Current direction", Uint16),
    input(0x0021, "Current position", Int32).unit("pulse"),
    input(0x0023, "Current speed (x10)", Uint32).unit("Step/s"),
    input(0x0025, "Error register", Uint16),
    input(0x0026, "Current alarm code", Uint16),
    input(0x0027, "Stored alarm count", Uint16),
    // Alarm history
    input(0x0028, "Alarm history 1", Uint16),
    input(0x0029, "Alarm history 2", Uint16),
    input(0x002A, "Alarm history 3", Uint16),
    input(0x002B, "Alarm history 4", Uint16),
    input(0x002C, "Alarm history 5", Uint16),
    input(0x002D, "Alarm history 6", Uint16),
    input(0x002E, "Alarm history 7", Uint16),
    input(0x002F, "Alarm history 8", Uint16),
];

pub fn get_register(address: u16, reg_type: RegisterType) -> Option<&'static RegisterDef> {
    let table = match reg_type {
        RegisterType::Holding => HOLDING_REGISTERS,
        RegisterType::Input => INPUT_REGISTERS,
    };
    table.iter().find(|def| def.address == address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_type() {
        let holding = get_register(0x0017, RegisterType::Holding).unwrap();
        assert_eq!(holding.name, "Acceleration current");
        assert!(holding.writable);

        let input = get_register(0x0017, RegisterType::Input).unwrap();
        assert_eq!(input.name, "Input voltage");
        assert!(!input.writable);

        assert!(get_register(0x0100, RegisterType::Holding).is_none());
    }

    #[test]
    fn test_addresses_are_unique_and_do_not_overlap() {
        for table in [HOLDING_REGISTERS, INPUT_REGISTERS] {
            for pair in table.windows(2) {
                assert!(
                    pair[0].address + pair[0].count() <= pair[1].address,
                    "{} overlaps {}",
                    pair[0].name,
                    pair[1].name
                );
            }
        }
    }

    #[test]
    fn test_decode_signed_position() {
        let position = get_register(0x0021, RegisterType::Input).unwrap();
        assert_eq!(position.count(), 2);
        assert_eq!(position.decode(&[0xFFFF, 0xFC18]), Some(-1000));
        assert_eq!(position.decode(&[0xFFFF]), None);

        let voltage = get_register(0x0017, RegisterType::Input).unwrap();
        assert_eq!(voltage.decode(&[24]), Some(24));
    }

    #[test]
    fn test_range_check() {
        let run_mode = get_register(0x0039, RegisterType::Holding).unwrap();
        assert!(run_mode.in_range(1));
        assert!(run_mode.in_range(4));
        assert!(!run_mode.in_range(0));

        let control = get_register(0x0051, RegisterType::Holding).unwrap();
        assert!(control.in_range(0xFFFF));
    }
}
