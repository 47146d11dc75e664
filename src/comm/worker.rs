//! Communication worker: the only thread allowed to touch the serial channel.
//!
//! Callers hand work over through a single-slot mailbox guarded by a mutex and
//! a condition variable. A newer submission replaces one the loop has not yet
//! taken, so callers that need every request delivered must wait for each
//! response before submitting the next one (see `services::session`).

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::serial_port::SerialChannel;
use crate::config::{SerialConfig, WorkerConfig};
use crate::modbus::protocol::{ModbusRequest, ModbusResponse};
use crate::modbus::rtu::{build_frame, expected_response_length, parse_response};
use crate::utils::error::ModbusError;

/// Notifications pushed by the worker. Delivery never blocks the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CommEvent {
    Connected,
    Disconnected,
    ConnectionError(String),
    ResponseReceived(ModbusResponse),
    RawDataReceived(Vec<u8>),
    RawDataSent(Vec<u8>),
    BytesCountUpdated { tx: u64, rx: u64 },
    /// A submission could not be turned into a frame; nothing was sent.
    RequestRejected { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Submission {
    Modbus(ModbusRequest),
    Raw(Vec<u8>),
}

type Channel = Box<dyn SerialChannel>;

struct Shared {
    mailbox: Mutex<Option<Submission>>,
    wake: Condvar,
    running: AtomicBool,
    connected: AtomicBool,
    /// Set while the loop handles a submission it took from the mailbox.
    busy: AtomicBool,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    loop_exited: Mutex<bool>,
    exit_signal: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CommWorker {
    channel: Arc<Mutex<Channel>>,
    shared: Arc<Shared>,
    events: UnboundedSender<CommEvent>,
    timing: WorkerConfig,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CommWorker {
    pub fn new(
        channel: Box<dyn SerialChannel>,
        timing: WorkerConfig,
    ) -> (Self, UnboundedReceiver<CommEvent>) {
        let (events, receiver) = unbounded_channel();
        let worker = Self {
            channel: Arc::new(Mutex::new(channel)),
            shared: Arc::new(Shared {
                mailbox: Mutex::new(None),
                wake: Condvar::new(),
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                tx_bytes: AtomicU64::new(0),
                rx_bytes: AtomicU64::new(0),
                loop_exited: Mutex::new(true),
                exit_signal: Condvar::new(),
            }),
            events,
            timing,
            thread: Mutex::new(None),
        };
        (worker, receiver)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True when nothing is waiting in the mailbox and the loop is not in the
    /// middle of an exchange. Every event of earlier work has been sent by then.
    pub fn is_idle(&self) -> bool {
        let slot = lock(&self.shared.mailbox);
        slot.is_none() && !self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.shared.tx_bytes.load(Ordering::SeqCst)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.shared.rx_bytes.load(Ordering::SeqCst)
    }

    /// Opens the channel and starts the loop thread. On failure a
    /// `ConnectionError` event is emitted and no loop is started.
    pub fn connect(&self, config: &SerialConfig) -> Result<(), ModbusError> {
        if let Err(e) = lock(&self.channel).open(config) {
            error!("Connection to {} failed: {}", config.port, e);
            self.emit(CommEvent::ConnectionError(e.to_string()));
            return Err(e);
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        // The loop publishes its exit under `loop_exited` after its last look at
        // `running`, so either it sees the store above or a new loop is spawned here.
        let mut thread_slot = lock(&self.thread);
        let mut exited = lock(&self.shared.loop_exited);
        if *exited {
            *exited = false;
            drop(exited);
            if let Some(old) = thread_slot.take() {
                let _ = old.join();
            }

            let shared = Arc::clone(&self.shared);
            let channel = Arc::clone(&self.channel);
            let events = self.events.clone();
            let timing = self.timing.clone();
            let handle = thread::Builder::new()
                .name("comm-worker".to_string())
                .spawn(move || run_loop(shared, channel, events, timing))
                .map_err(|e| {
                    self.shared.running.store(false, Ordering::SeqCst);
                    *lock(&self.shared.loop_exited) = true;
                    ModbusError::ServiceNotAvailable(format!("Cannot spawn worker thread: {}", e))
                })?;
            *thread_slot = Some(handle);
        }

        info!("Connected to {} ({})", config.port, config.describe());
        self.emit(CommEvent::Connected);
        Ok(())
    }

    /// Stops the loop (waiting at most `disconnect_wait`) and closes the channel.
    pub fn disconnect(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let _slot = lock(&self.shared.mailbox);
            self.shared.wake.notify_all();
        }

        let mut thread_slot = lock(&self.thread);
        if thread_slot.is_some() {
            if self.wait_for_loop_exit(self.timing.disconnect_wait()) {
                if let Some(handle) = thread_slot.take() {
                    let _ = handle.join();
                }
            } else {
                // The handle stays; connect() joins it once the loop reports its exit.
                warn!(
                    "Worker loop did not stop within {:?}",
                    self.timing.disconnect_wait()
                );
            }
        }
        drop(thread_slot);

        lock(&self.channel).close();
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("Disconnected");
        self.emit(CommEvent::Disconnected);
    }

    /// Queues a Modbus request, replacing any submission the loop has not taken yet.
    pub fn submit_modbus(&self, request: ModbusRequest) {
        self.submit(Submission::Modbus(request));
    }

    /// Queues raw bytes to be written verbatim, with the same replacement rule.
    pub fn submit_raw(&self, data: Vec<u8>) {
        self.submit(Submission::Raw(data));
    }

    pub fn reset_counters(&self) {
        self.shared.tx_bytes.store(0, Ordering::SeqCst);
        self.shared.rx_bytes.store(0, Ordering::SeqCst);
        self.emit(CommEvent::BytesCountUpdated { tx: 0, rx: 0 });
    }

    fn submit(&self, submission: Submission) {
        let mut slot = lock(&self.shared.mailbox);
        if slot.is_some() {
            debug!("Replacing a submission the worker had not picked up yet");
        }
        *slot = Some(submission);
        self.shared.wake.notify_one();
    }

    fn wait_for_loop_exit(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut exited = lock(&self.shared.loop_exited);
        while !*exited {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .exit_signal
                .wait_timeout(exited, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            exited = guard;
        }
        true
    }

    fn emit(&self, event: CommEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for CommWorker {
    fn drop(&mut self) {
        if self.is_running() {
            self.disconnect();
        }
    }
}

/// State owned by the loop thread for the lifetime of one run.
struct LoopContext {
    shared: Arc<Shared>,
    events: UnboundedSender<CommEvent>,
    timing: WorkerConfig,
}

fn run_loop(
    shared: Arc<Shared>,
    channel: Arc<Mutex<Channel>>,
    events: UnboundedSender<CommEvent>,
    timing: WorkerConfig,
) {
    let ctx = LoopContext {
        shared,
        events,
        timing,
    };
    debug!("Worker loop started");

    while ctx.keep_running() {
        let submission = ctx.next_submission();
        if !ctx.shared.running.load(Ordering::SeqCst) {
            ctx.shared.busy.store(false, Ordering::SeqCst);
            continue;
        }

        let mut channel = lock(&channel);
        let outcome = ctx.run_iteration(&mut **channel, submission);
        if let Err(e) = outcome {
            if e.is_channel_fault() {
                error!("Worker loop stopping after channel failure: {}", e);
                if ctx.shared.running.load(Ordering::SeqCst) {
                    channel.close();
                    ctx.shared.connected.store(false, Ordering::SeqCst);
                    ctx.emit(CommEvent::ConnectionError(format!(
                        "Communication failure: {}",
                        e
                    )));
                    ctx.emit(CommEvent::Disconnected);
                    ctx.shared.running.store(false, Ordering::SeqCst);
                }
                ctx.shared.busy.store(false, Ordering::SeqCst);
                continue;
            }
            warn!("Submission rejected: {}", e);
            ctx.emit(CommEvent::RequestRejected {
                reason: e.to_string(),
            });
        }
        ctx.shared.busy.store(false, Ordering::SeqCst);
    }

    debug!("Worker loop exited");
}

impl LoopContext {
    /// Checks `running` while holding `loop_exited`. Returning false marks the
    /// loop as gone; nothing below the call site touches shared state.
    fn keep_running(&self) -> bool {
        let mut exited = lock(&self.shared.loop_exited);
        if self.shared.running.load(Ordering::SeqCst) {
            return true;
        }
        *exited = true;
        self.shared.exit_signal.notify_all();
        false
    }

    /// Takes the pending submission, waiting up to one poll interval for one to arrive.
    fn next_submission(&self) -> Option<Submission> {
        let mut slot = lock(&self.shared.mailbox);
        if slot.is_none() {
            let (guard, _) = self
                .shared
                .wake
                .wait_timeout(slot, self.timing.poll_interval())
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
        let taken = slot.take();
        if taken.is_some() {
            self.shared.busy.store(true, Ordering::SeqCst);
        }
        taken
    }

    fn run_iteration(
        &self,
        channel: &mut dyn SerialChannel,
        submission: Option<Submission>,
    ) -> Result<(), ModbusError> {
        match submission {
            Some(Submission::Raw(data)) => self.handle_raw_send(channel, data)?,
            Some(Submission::Modbus(request)) => self.handle_modbus(channel, &request)?,
            None => {}
        }

        // Background receive: anything left on the line is surfaced as raw data.
        if channel.is_open() {
            let incoming = channel.read_all()?;
            if !incoming.is_empty() {
                self.add_rx(incoming.len());
                self.emit(CommEvent::RawDataReceived(incoming));
                self.emit_counts();
            }
        }
        Ok(())
    }

    fn handle_raw_send(
        &self,
        channel: &mut dyn SerialChannel,
        data: Vec<u8>,
    ) -> Result<(), ModbusError> {
        let written = channel.write(&data)?;
        self.add_tx(written);
        debug!("RAW TX: {}", hex::encode_upper(&data));
        self.emit(CommEvent::RawDataSent(data));
        self.emit_counts();
        Ok(())
    }

    fn handle_modbus(
        &self,
        channel: &mut dyn SerialChannel,
        request: &ModbusRequest,
    ) -> Result<(), ModbusError> {
        let frame = build_frame(request)?;

        channel.flush_input()?;
        let written = channel.write(&frame)?;
        self.add_tx(written);
        if written != frame.len() {
            warn!(
                "Incomplete write: expected {} bytes, wrote {}",
                frame.len(),
                written
            );
        }
        debug!("TX: {}", hex::encode_upper(&frame));
        self.emit(CommEvent::RawDataSent(frame.clone()));

        thread::sleep(self.timing.frame_gap());

        let raw_rx = channel.read(expected_response_length(request))?;
        self.add_rx(raw_rx.len());

        let response = if raw_rx.is_empty() {
            debug!("No response from slave {}", request.slave_id);
            ModbusResponse::timeout(request, frame)
        } else {
            debug!("RX: {}", hex::encode_upper(&raw_rx));
            let mut response = parse_response(&raw_rx, request);
            response.raw_tx = frame;
            response.timestamp = Some(Utc::now());
            response
        };

        self.emit(CommEvent::ResponseReceived(response));
        self.emit_counts();
        Ok(())
    }

    fn add_tx(&self, n: usize) {
        self.shared.tx_bytes.fetch_add(n as u64, Ordering::SeqCst);
    }

    fn add_rx(&self, n: usize) {
        self.shared.rx_bytes.fetch_add(n as u64, Ordering::SeqCst);
    }

    fn emit_counts(&self) {
        self.emit(CommEvent::BytesCountUpdated {
            tx: self.shared.tx_bytes.load(Ordering::SeqCst),
            rx: self.shared.rx_bytes.load(Ordering::SeqCst),
        });
    }

    fn emit(&self, event: CommEvent) {
        let _ = self.events.send(event);
    }
}
