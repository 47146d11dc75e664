//! In-memory `SerialChannel` used by unit tests to stand in for a drive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::serial_port::SerialChannel;
use crate::config::SerialConfig;
use crate::utils::error::ModbusError;

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    fail_write: bool,
    writes: Vec<Vec<u8>>,
    /// Replies handed out by `read`, one per call.
    replies: VecDeque<Vec<u8>>,
    /// Bytes handed out by `read_all`, one chunk per call.
    unsolicited: VecDeque<Vec<u8>>,
    read_delay: Option<Duration>,
    flushes: usize,
    reads: usize,
    write_times: Vec<Instant>,
    read_times: Vec<Instant>,
}

/// Cloning shares the underlying state, so a test keeps one handle while the
/// worker owns another.
#[derive(Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn push_reply(&self, reply: &[u8]) {
        self.state().replies.push_back(reply.to_vec());
    }

    pub fn push_unsolicited(&self, data: &[u8]) {
        self.state().unsolicited.push_back(data.to_vec());
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    pub fn set_fail_write(&self, fail: bool) {
        self.state().fail_write = fail;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.state().read_delay = Some(delay);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// When each `write` and `read` call was made, in call order.
    pub fn write_times(&self) -> Vec<Instant> {
        self.state().write_times.clone()
    }

    pub fn read_times(&self) -> Vec<Instant> {
        self.state().read_times.clone()
    }

    pub fn flushes(&self) -> usize {
        self.state().flushes
    }

    pub fn is_open_now(&self) -> bool {
        self.state().open
    }

    /// Polls until at least `count` frames were written or `timeout` passes.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state().writes.len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

impl SerialChannel for MockChannel {
    fn open(&mut self, config: &SerialConfig) -> Result<(), ModbusError> {
        let mut state = self.state();
        if state.fail_open {
            return Err(ModbusError::ConnectionError(format!(
                "Failed to open port {}",
                config.port
            )));
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ModbusError> {
        let mut state = self.state();
        if !state.open {
            return Err(ModbusError::PortNotOpen);
        }
        if state.fail_write {
            return Err(ModbusError::CommunicationError("Write failed: device gone".into()));
        }
        state.writes.push(data.to_vec());
        state.write_times.push(Instant::now());
        Ok(data.len())
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>, ModbusError> {
        let (delay, reply) = {
            let mut state = self.state();
            if !state.open {
                return Err(ModbusError::PortNotOpen);
            }
            state.reads += 1;
            state.read_times.push(Instant::now());
            (state.read_delay, state.replies.pop_front())
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let mut reply = reply.unwrap_or_default();
        reply.truncate(size);
        Ok(reply)
    }

    fn read_all(&mut self) -> Result<Vec<u8>, ModbusError> {
        let mut state = self.state();
        if !state.open {
            return Err(ModbusError::PortNotOpen);
        }
        Ok(state.unsolicited.pop_front().unwrap_or_default())
    }

    fn flush_input(&mut self) -> Result<(), ModbusError> {
        self.state().flushes += 1;
        Ok(())
    }
}
