use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Instant};

use crate::comm::{CommEvent, CommWorker};
use crate::modbus::protocol::{ModbusRequest, ModbusResponse};
use crate::modbus::rtu::build_frame;
use crate::utils::error::ModbusError;

pub type EventObserver = Box<dyn FnMut(&CommEvent) + Send>;

const IDLE_POLL: Duration = Duration::from_millis(5);

#[async_trait]
pub trait ModbusTransport: Send {
    /// Sends one request and resolves with its response, faulted or not.
    async fn request(&mut self, request: ModbusRequest) -> Result<ModbusResponse, ModbusError>;
}

/// Request/response view over a `CommWorker`.
///
/// The worker's mailbox keeps only the newest submission, so the session never
/// submits a request before the previous one has been answered.
///
/// Responses carry no request id and are matched by their transmitted frame.
/// A request that timed out here may still be answered by the worker later, so
/// each request first waits for the worker to go idle and drains what it left
/// behind. Another caller submitting to the same worker is not accounted for.
pub struct ModbusSession {
    worker: Arc<CommWorker>,
    events: UnboundedReceiver<CommEvent>,
    response_timeout: Duration,
    observer: Option<EventObserver>,
}

impl ModbusSession {
    pub fn new(
        worker: Arc<CommWorker>,
        events: UnboundedReceiver<CommEvent>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            worker,
            events,
            response_timeout,
            observer: None,
        }
    }

    pub fn worker(&self) -> &Arc<CommWorker> {
        &self.worker
    }

    /// Receives every event that is not the awaited response.
    pub fn set_observer(&mut self, observer: EventObserver) {
        self.observer = Some(observer);
    }

    /// Runs `requests` one after another. Stops after the first faulted
    /// response, which is the last element of the returned list.
    pub async fn run_sequence(
        &mut self,
        requests: Vec<ModbusRequest>,
    ) -> Result<Vec<ModbusResponse>, ModbusError> {
        let total = requests.len();
        let mut responses = Vec::with_capacity(total);

        for (step, request) in requests.into_iter().enumerate() {
            let response = self.request(request).await?;
            let faulted = response.is_fault();
            responses.push(response);
            if faulted {
                warn!("Sequence aborted at step {} of {}", step + 1, total);
                break;
            }
        }
        Ok(responses)
    }

    /// Forwards whatever events are already queued to the observer.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.notify(&event);
        }
    }

    /// Forwards events to the observer until `duration` has passed.
    pub async fn listen(&mut self, duration: Duration) {
        let _ = timeout(duration, async {
            while let Some(event) = self.events.recv().await {
                self.notify(&event);
            }
        })
        .await;
    }

    /// Waits, at most one response timeout, until the worker has finished
    /// whatever it was doing.
    async fn wait_until_idle(&mut self) -> Result<(), ModbusError> {
        let deadline = Instant::now() + self.response_timeout;
        while !self.worker.is_idle() {
            if Instant::now() >= deadline {
                warn!("Worker still busy with an earlier exchange");
                return Err(ModbusError::Timeout);
            }
            sleep(IDLE_POLL).await;
        }
        Ok(())
    }

    async fn await_response(&mut self, frame: &[u8]) -> Result<ModbusResponse, ModbusError> {
        loop {
            let event = self.events.recv().await.ok_or_else(|| {
                ModbusError::ServiceNotAvailable("Worker event channel closed".to_string())
            })?;

            match event {
                CommEvent::ResponseReceived(response) if response.raw_tx == frame => {
                    return Ok(response);
                }
                CommEvent::RequestRejected { ref reason } => {
                    self.notify(&event);
                    return Err(ModbusError::InvalidRequest(reason.clone()));
                }
                CommEvent::ConnectionError(ref message) => {
                    self.notify(&event);
                    return Err(ModbusError::CommunicationError(message.clone()));
                }
                CommEvent::Disconnected => {
                    self.notify(&event);
                    return Err(ModbusError::PortNotOpen);
                }
                other => {
                    if let CommEvent::ResponseReceived(_) = other {
                        debug!("Discarding a response to an earlier request");
                    }
                    self.notify(&other);
                }
            }
        }
    }

    fn notify(&mut self, event: &CommEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }
}

#[async_trait]
impl ModbusTransport for ModbusSession {
    async fn request(&mut self, request: ModbusRequest) -> Result<ModbusResponse, ModbusError> {
        if !self.worker.is_running() {
            return Err(ModbusError::PortNotOpen);
        }
        let frame = build_frame(&request)?;

        // Anything still queued belongs to earlier traffic.
        self.wait_until_idle().await?;
        self.drain_events();

        debug!(
            "Submitting {} to slave {} at 0x{:04X}",
            request.function_code, request.slave_id, request.address
        );
        self.worker.submit_modbus(request);

        let response = timeout(self.response_timeout, self.await_response(&frame)).await??;
        if let Some(fault) = response.fault {
            info!("Slave {} answered with fault: {}", response.slave_id, fault);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::mock_channel::MockChannel;
    use crate::config::{SerialConfig, WorkerConfig};
    use crate::modbus::crc::append_crc;
    use crate::modbus::protocol::ResponseFault;
    use std::sync::Mutex;

    fn session_with(mock: &MockChannel) -> ModbusSession {
        let timing = WorkerConfig {
            poll_interval_ms: 10,
            frame_gap_ms: 1,
            disconnect_wait_ms: 2000,
        };
        let (worker, events) = CommWorker::new(Box::new(mock.clone()), timing);
        worker.connect(&SerialConfig::default()).unwrap();
        ModbusSession::new(Arc::new(worker), events, Duration::from_secs(2))
    }

    fn echo(request: &ModbusRequest) -> Vec<u8> {
        build_frame(request).unwrap()
    }

    #[tokio::test]
    async fn test_request_returns_matching_response() {
        let mock = MockChannel::new();
        mock.push_reply(&append_crc(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x86, 0xA0]));
        let mut session = session_with(&mock);

        let request = ModbusRequest::read_holding(1, 0x0053, 2);
        let response = session.request(request.clone()).await.unwrap();

        assert_eq!(response.values, vec![0x0001, 0x86A0]);
        assert_eq!(response.raw_tx, echo(&request));
        session.worker().disconnect();
    }

    #[tokio::test]
    async fn test_sequence_sends_every_request_in_order() {
        let mock = MockChannel::new();
        let requests = vec![
            ModbusRequest::write_multiple(1, 0x0053, vec![0xFFFF, 0xFC18]),
            ModbusRequest::write_single(1, 0x0051, 0x004F),
            ModbusRequest::write_single(1, 0x0051, 0x005F),
        ];
        mock.push_reply(&append_crc(&[0x01, 0x10, 0x00, 0x53, 0x00, 0x02]));
        mock.push_reply(&echo(&requests[1]));
        mock.push_reply(&echo(&requests[2]));

        let mut session = session_with(&mock);
        let responses = session.run_sequence(requests.clone()).await.unwrap();

        assert_eq!(responses.len(), 3);
        assert!(responses.iter().all(|r| !r.is_fault()));
        assert_eq!(
            mock.writes(),
            requests.iter().map(echo).collect::<Vec<_>>()
        );
        session.worker().disconnect();
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_fault() {
        let mock = MockChannel::new();
        let requests = vec![
            ModbusRequest::write_single(1, 0x0039, 2),
            ModbusRequest::write_single(1, 0x0051, 0x000F),
        ];
        mock.push_reply(&append_crc(&[0x01, 0x86, 0x03]));

        let mut session = session_with(&mock);
        let responses = session.run_sequence(requests.clone()).await.unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].fault, Some(ResponseFault::Exception(0x03)));
        assert_eq!(mock.writes(), vec![echo(&requests[0])]);
        session.worker().disconnect();
    }

    #[tokio::test]
    async fn test_silent_slave_yields_timeout_fault() {
        let mock = MockChannel::new();
        let mut session = session_with(&mock);

        let response = session
            .request(ModbusRequest::read_input(7, 0x0017, 16))
            .await
            .unwrap();
        assert_eq!(response.fault, Some(ResponseFault::Timeout));
        assert_eq!(response.fault_code(), -2);
        session.worker().disconnect();
    }

    #[tokio::test]
    async fn test_invalid_request_fails_before_submission() {
        let mock = MockChannel::new();
        let mut session = session_with(&mock);

        let err = session
            .request(ModbusRequest::read_holding(1, 0, 126))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidRequest(_)));
        assert!(mock.writes().is_empty());
        session.worker().disconnect();
    }

    #[tokio::test]
    async fn test_request_without_connection_is_refused() {
        let mock = MockChannel::new();
        let (worker, events) = CommWorker::new(Box::new(mock.clone()), WorkerConfig::default());
        let mut session = ModbusSession::new(Arc::new(worker), events, Duration::from_secs(1));

        let err = session
            .request(ModbusRequest::read_holding(1, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::PortNotOpen));
    }

    #[tokio::test]
    async fn test_late_answer_to_timed_out_request_is_not_reused() {
        let mock = MockChannel::new();
        mock.set_read_delay(Duration::from_millis(300));
        mock.push_reply(&append_crc(&[0x01, 0x03, 0x02, 0x00, 0x01]));
        mock.push_reply(&append_crc(&[0x01, 0x03, 0x02, 0x00, 0x02]));
        let (worker, events) = CommWorker::new(
            Box::new(mock.clone()),
            WorkerConfig {
                poll_interval_ms: 10,
                frame_gap_ms: 1,
                disconnect_wait_ms: 2000,
            },
        );
        worker.connect(&SerialConfig::default()).unwrap();
        let mut session = ModbusSession::new(Arc::new(worker), events, Duration::from_millis(200));

        let stale = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stale);
        session.set_observer(Box::new(move |event| {
            if let CommEvent::ResponseReceived(response) = event {
                sink.lock().unwrap().push(response.values.clone());
            }
        }));

        // Same frame both times.
        let request = ModbusRequest::read_holding(1, 0x0039, 1);
        let err = session.request(request.clone()).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout));

        // The worker is still reading for the first request.
        mock.set_read_delay(Duration::ZERO);
        let response = session.request(request.clone()).await.unwrap();

        assert_eq!(response.values, vec![2]);
        assert_eq!(*stale.lock().unwrap(), vec![vec![1]]);
        assert_eq!(mock.writes(), vec![echo(&request), echo(&request)]);
        session.worker().disconnect();
    }

    #[tokio::test]
    async fn test_other_events_reach_observer() {
        let mock = MockChannel::new();
        mock.push_reply(&append_crc(&[0x01, 0x03, 0x02, 0x00, 0x01]));
        let mut session = session_with(&mock);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.set_observer(Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        let request = ModbusRequest::read_holding(1, 0x0039, 1);
        session.request(request.clone()).await.unwrap();
        session.drain_events();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&CommEvent::Connected));
        assert!(seen.contains(&CommEvent::RawDataSent(echo(&request))));
        assert!(!seen
            .iter()
            .any(|event| matches!(event, CommEvent::ResponseReceived(_))));
        drop(seen);
        session.worker().disconnect();
    }
}
