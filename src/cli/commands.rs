use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::{parse_hex_bytes, parse_i64, parse_u16, parse_u16_list};
use crate::comm::{list_ports, CommEvent, CommWorker, SerialPortChannel};
use crate::config::Config;
use crate::devices::motor::{MotorEvent, MotorService, RunMode};
use crate::devices::registers::{get_register, RegisterType};
use crate::modbus::protocol::{ModbusRequest, ModbusResponse};
use crate::modbus::values::split_32bit;
use crate::output::{formatter_for, ConsoleFormatter, Direction, ResponseFormatter};
use crate::services::{ModbusSession, ModbusTransport};

pub async fn handle_subcommands(matches: &ArgMatches) -> Result<()> {
    let formatter: Arc<dyn ResponseFormatter> = match matches.get_one::<String>("format") {
        Some(name) => Arc::from(
            formatter_for(name).ok_or_else(|| anyhow!("Unknown output format: {}", name))?,
        ),
        None => Arc::new(ConsoleFormatter),
    };

    match matches.subcommand() {
        Some(("ports", _)) => print_ports(),
        Some(("init-config", sub)) => {
            let path = sub
                .get_one::<String>("path")
                .ok_or_else(|| anyhow!("Missing path"))?;
            let config = Config::from_matches(matches)?;
            config.save_to_file(path)?;
            println!("✅ Configuration written to {}", path);
            Ok(())
        }
        Some((name, sub)) => {
            let config = Config::from_matches(matches)?;
            let mut session = open_session(&config, &formatter)?;
            print!("{}", formatter.format_header());
            let result = run_on_session(name, sub, &config, &mut session, formatter.as_ref()).await;
            session.worker().disconnect();
            session.drain_events();
            result
        }
        None => bail!("No command given, see --help"),
    }
}

fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    println!("📡 Available Serial Ports:");
    if ports.is_empty() {
        println!("   ⚠️  No serial ports found");
        return Ok(());
    }
    for (index, port) in ports.iter().enumerate() {
        println!("   {}. {}", index + 1, port.name);
        if let Some(manufacturer) = &port.manufacturer {
            println!("      📱 Manufacturer: {}", manufacturer);
        }
        if let Some(serial_number) = &port.serial_number {
            println!("      🔢 Serial Number: {}", serial_number);
        }
    }
    Ok(())
}

fn open_session(config: &Config, formatter: &Arc<dyn ResponseFormatter>) -> Result<ModbusSession> {
    let (worker, events) = CommWorker::new(Box::new(SerialPortChannel::new()), config.worker.clone());
    worker
        .connect(&config.serial)
        .with_context(|| format!("Cannot open {}", config.serial.port))?;

    let mut session = ModbusSession::new(Arc::new(worker), events, config.response_timeout());
    let printer = Arc::clone(formatter);
    session.set_observer(Box::new(move |event| match event {
        CommEvent::RawDataSent(bytes) => debug!("{}", printer.format_raw(Direction::Tx, bytes)),
        CommEvent::RawDataReceived(bytes) => {
            println!("{}", printer.format_raw(Direction::Rx, bytes))
        }
        CommEvent::BytesCountUpdated { tx, rx } => debug!("Bytes TX {} / RX {}", tx, rx),
        CommEvent::ConnectionError(message) => eprintln!("❌ {}", message),
        CommEvent::RequestRejected { reason } => eprintln!("❌ Request rejected: {}", reason),
        other => debug!("{:?}", other),
    }));
    Ok(session)
}

fn address_of(sub: &ArgMatches) -> Result<u16> {
    let address = sub
        .get_one::<String>("address")
        .ok_or_else(|| anyhow!("Missing --address"))?;
    Ok(parse_u16(address)?)
}

fn required<'a>(sub: &'a ArgMatches, id: &str) -> Result<&'a String> {
    sub.get_one::<String>(id)
        .ok_or_else(|| anyhow!("Missing --{}", id))
}

async fn run_on_session(
    name: &str,
    sub: &ArgMatches,
    config: &Config,
    session: &mut ModbusSession,
    formatter: &dyn ResponseFormatter,
) -> Result<()> {
    let slave = config.slave_id;

    match name {
        "read" => {
            let address = address_of(sub)?;
            let count = parse_u16(required(sub, "count")?)?;
            let request = if sub.get_flag("input") {
                ModbusRequest::read_input(slave, address, count)
            } else {
                ModbusRequest::read_holding(slave, address, count)
            };
            exchange(session, request, formatter).await
        }
        "write" => {
            let address = address_of(sub)?;
            let value = parse_u16(required(sub, "value")?)?;
            if let Some(warning) = range_warning(address, value as i64) {
                warn!("{}", warning);
            }
            exchange(session, ModbusRequest::write_single(slave, address, value), formatter).await
        }
        "write32" => {
            let address = address_of(sub)?;
            let value = parse_i64(required(sub, "value")?)?;
            let in_range = if sub.get_flag("signed") {
                (i32::MIN as i64..=i32::MAX as i64).contains(&value)
            } else {
                (0..=u32::MAX as i64).contains(&value)
            };
            if !in_range {
                bail!("Value {} does not fit in 32 bits", value);
            }
            let (high, low) = split_32bit(value);
            let request = ModbusRequest::write_multiple(slave, address, vec![high, low]);
            exchange(session, request, formatter).await
        }
        "write-multi" => {
            let address = address_of(sub)?;
            let values = parse_u16_list(required(sub, "values")?)?;
            exchange(session, ModbusRequest::write_multiple(slave, address, values), formatter)
                .await
        }
        "raw" => {
            let bytes = parse_hex_bytes(required(sub, "hex")?)?;
            let listen: u64 = required(sub, "listen")?
                .parse()
                .context("Invalid --listen value")?;

            println!("{}", formatter.format_raw(Direction::Tx, &bytes));
            session.worker().submit_raw(bytes);
            if listen == 0 {
                println!("Listening, press Ctrl-C to stop");
                tokio::select! {
                    _ = session.listen(Duration::MAX) => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            } else {
                session.listen(Duration::from_millis(listen)).await;
            }
            Ok(())
        }
        "status" => {
            let motor = MotorService::new(slave);
            let response = session.request(motor.refresh_status()).await?;
            report_motor(&motor, &response, formatter);
            Ok(())
        }
        "motor" => run_motor(sub, slave, session, formatter).await,
        other => bail!("Unknown command: {}", other),
    }
}

async fn exchange(
    session: &mut ModbusSession,
    request: ModbusRequest,
    formatter: &dyn ResponseFormatter,
) -> Result<()> {
    let response = session.request(request).await?;
    println!("{}", formatter.format_response(&response));
    if response.is_fault() {
        bail!("Request failed with code {}", response.fault_code());
    }
    Ok(())
}

/// Values outside a known register's documented range are still sent; the
/// drive has the final say.
fn range_warning(address: u16, value: i64) -> Option<String> {
    let def = get_register(address, RegisterType::Holding)?;
    if def.in_range(value) {
        return None;
    }
    Some(format!(
        "{} is outside the documented range of '{}' (0x{:04X})",
        value, def.name, address
    ))
}

fn motor_requests(motor: &MotorService, action: &str, sub: &ArgMatches) -> Result<Vec<ModbusRequest>> {
    let position = || -> Result<i64> { Ok(parse_i64(required(sub, "position")?)?) };

    let requests = match action {
        "startup" => vec![motor.startup()],
        "enable" => vec![motor.enable()],
        "run" => vec![motor.run()],
        "stop" => vec![motor.stop()],
        "quick-stop" => vec![motor.quick_stop()],
        "disable" => vec![motor.disable()],
        "clear-fault" => vec![motor.clear_fault()],
        "move-rel" => motor.move_relative(position()?),
        "move-abs" => motor.move_absolute(position()?),
        "speed" => {
            let speed = parse_i64(required(sub, "speed")?)?;
            let direction = parse_u16(required(sub, "direction")?)?;
            motor.set_speed(speed, direction)
        }
        "home" => motor.start_homing(),
        "mode" => {
            let name = required(sub, "mode")?;
            let mode = RunMode::parse(name).ok_or_else(|| anyhow!("Unknown run mode: {}", name))?;
            vec![motor.set_run_mode(mode)]
        }
        "save" => vec![motor.save_params()],
        "restore" => vec![motor.restore_defaults()],
        "origin" => vec![motor.set_origin()],
        "zero" => vec![motor.set_zero()],
        other => bail!("Unknown motor action: {}", other),
    };
    Ok(requests)
}

async fn run_motor(
    sub: &ArgMatches,
    slave: u8,
    session: &mut ModbusSession,
    formatter: &dyn ResponseFormatter,
) -> Result<()> {
    let action = required(sub, "action")?;
    let motor = MotorService::new(slave);
    let requests = motor_requests(&motor, action, sub)?;
    let expected = requests.len();

    info!("🔧 Running '{}' ({} request(s))", action, expected);
    let responses = session.run_sequence(requests).await?;
    for response in &responses {
        report_motor(&motor, response, formatter);
    }

    match responses.last() {
        Some(last) if last.is_fault() => bail!("'{}' aborted", action),
        _ if responses.len() < expected => bail!("'{}' incomplete", action),
        _ => Ok(()),
    }
}

fn report_motor(motor: &MotorService, response: &ModbusResponse, formatter: &dyn ResponseFormatter) {
    match motor.handle_response(response) {
        MotorEvent::StatusUpdated(status) => println!("{}", formatter.format_status(&status)),
        MotorEvent::OperationDone { ok: true, message } => {
            debug!("{}", formatter.format_response(response));
            println!("✅ {}", message);
        }
        MotorEvent::OperationDone { ok: false, message } => println!("❌ {}", message),
        MotorEvent::ParamsRead(_) => println!("{}", formatter.format_response(response)),
        MotorEvent::Ignored => println!("⚠️  Status block too short to decode"),
    }
}
