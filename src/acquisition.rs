//! Per-instrument acquisition state machine and polling thread.
//!
//! ```text
//! Idle --arm--> Armed --triggered--> DataReady --> Downloading --+--> Armed (continuous)
//!                 ^  |                                           +--> Idle  (single)
//!                 +--+ not triggered: sleep with bounded backoff
//! ```
//! A failed download discards the partial capture and goes back to `Armed`.
//! After `failure_threshold` consecutive transport errors the instrument is
//! `Disconnected` and is not polled again until a reconnect is requested.

use crate::config::AcquisitionConf;
use crate::error::InstrumentError;
use crate::event::ShutdownFlag;
use crate::instrument::{Instrument, InstrumentId, TriggerMode, TriggerStatus, WaveformSet};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle = 0,
    Armed = 1,
    DataReady = 2,
    Downloading = 3,
    Disconnected = 4,
}

impl AcquisitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Armed,
            2 => Self::DataReady,
            3 => Self::Downloading,
            4 => Self::Disconnected,
            _ => Self::Idle,
        }
    }

    /// Whether the instrument is expected to deliver a capture soon.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Armed | Self::DataReady | Self::Downloading)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::DataReady => "data ready",
            Self::Downloading => "downloading",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Timing and retry limits for the polling loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionSettings {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub failure_threshold: u32,
    pub max_pending: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            max_backoff: Duration::from_millis(100),
            failure_threshold: 5,
            max_pending: 2,
        }
    }
}

impl From<&AcquisitionConf> for AcquisitionSettings {
    fn from(conf: &AcquisitionConf) -> Self {
        Self {
            poll_interval: Duration::from_millis(conf.poll_interval_ms),
            max_backoff: Duration::from_millis(conf.max_backoff_ms.max(conf.poll_interval_ms)),
            failure_threshold: conf.failure_threshold.max(1),
            max_pending: conf.max_pending.max(1),
        }
    }
}

/// Requests from the UI side to an instrument's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Arm(TriggerMode),
    Stop,
    Reconnect,
}

/// Progress reports from workers, drained by the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum AcqEvent {
    StateChanged {
        instrument: InstrumentId,
        state: AcquisitionState,
    },
    Downloaded {
        instrument: InstrumentId,
        bytes: usize,
    },
    Error {
        instrument: InstrumentId,
        message: String,
    },
}

/// Captures downloaded but not yet handed to the filter graph.
///
/// The worker pushes and the handoff thread pops; both ends live here so the
/// queue never disconnects while the control exists.
#[derive(Debug)]
pub struct PendingQueue {
    tx: Sender<WaveformSet>,
    rx: Receiver<WaveformSet>,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Queue a capture. Hands it back if the queue is full.
    pub fn push(&self, set: WaveformSet) -> Result<(), WaveformSet> {
        self.tx.try_send(set).map_err(|e| match e {
            TrySendError::Full(set) | TrySendError::Disconnected(set) => set,
        })
    }

    pub fn pop(&self) -> Option<WaveformSet> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

/// State shared between an instrument's worker thread and the rest of the session.
#[derive(Debug)]
pub struct InstrumentControl {
    pub name: String,
    state: AtomicU8,
    requests: Sender<ControlRequest>,
    pub pending: PendingQueue,
}

impl InstrumentControl {
    pub fn state(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AcquisitionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Requests the worker has not picked up yet.
    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn request(&self, request: ControlRequest) {
        // The worker owns the receiver for as long as the control exists;
        // a send can only fail after the worker has exited.
        if self.requests.send(request).is_err() {
            debug!("{}: worker gone, dropping {:?}", self.name, request);
        }
    }
}

/// What the loop should do after one state machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Sleep(Duration),
}

/// Drives one instrument through the acquisition state machine.
pub struct InstrumentWorker {
    id: InstrumentId,
    instrument: Box<dyn Instrument>,
    control: Arc<InstrumentControl>,
    requests: Receiver<ControlRequest>,
    events: Option<Sender<AcqEvent>>,
    settings: AcquisitionSettings,
    state: AcquisitionState,
    mode: TriggerMode,
    failures: u32,
    backoff: Duration,
}

impl InstrumentWorker {
    pub fn new(
        id: InstrumentId,
        instrument: Box<dyn Instrument>,
        settings: AcquisitionSettings,
    ) -> (Self, Arc<InstrumentControl>) {
        let (tx, rx) = unbounded();
        let control = Arc::new(InstrumentControl {
            name: instrument.name().to_string(),
            state: AtomicU8::new(AcquisitionState::Idle as u8),
            requests: tx,
            pending: PendingQueue::new(settings.max_pending),
        });
        let worker = Self {
            id,
            instrument,
            control: Arc::clone(&control),
            requests: rx,
            events: None,
            settings,
            state: AcquisitionState::Idle,
            mode: TriggerMode::Continuous,
            failures: 0,
            backoff: settings.poll_interval,
        };
        (worker, control)
    }

    pub fn with_events(mut self, events: Sender<AcqEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Poll until shutdown is requested. An in-flight download is abandoned
    /// at the next iteration boundary.
    pub fn run(mut self, shutdown: ShutdownFlag) {
        info!("Acquisition thread for {} started", self.control.name);
        loop {
            if shutdown.is_requested() {
                break;
            }
            match self.step() {
                Step::Continue => {}
                Step::Sleep(duration) => {
                    if shutdown.sleep(duration) {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.instrument.stop() {
            debug!("{}: stop on exit failed: {}", self.control.name, e);
        }
        info!("Acquisition thread for {} exited", self.control.name);
    }

    /// Run one state machine transition. Never sleeps; the caller decides how
    /// to wait.
    pub fn step(&mut self) -> Step {
        self.handle_requests();
        match self.state {
            AcquisitionState::Idle | AcquisitionState::Disconnected => {
                Step::Sleep(self.settings.poll_interval)
            }
            AcquisitionState::Armed => match self.instrument.poll_trigger() {
                Ok(TriggerStatus::Triggered) => {
                    self.backoff = self.settings.poll_interval;
                    self.set_state(AcquisitionState::DataReady);
                    Step::Continue
                }
                Ok(_) => {
                    let wait = self.backoff;
                    self.backoff = (self.backoff * 2).min(self.settings.max_backoff);
                    Step::Sleep(wait)
                }
                Err(e) => self.transport_failure(e),
            },
            AcquisitionState::DataReady => {
                if self.control.pending.is_full() {
                    // The GUI side has not caught up yet; keep the data on the instrument.
                    Step::Sleep(self.settings.poll_interval)
                } else {
                    self.set_state(AcquisitionState::Downloading);
                    Step::Continue
                }
            }
            AcquisitionState::Downloading => self.download(),
        }
    }

    fn download(&mut self) -> Step {
        let name = self.control.name.clone();
        let mut progress = |fraction: f32| debug!("{}: download {:.0}%", name, fraction * 100.0);
        match self.instrument.acquire_data(&mut progress) {
            Ok(raw) => {
                let set = raw.into_waveform_set();
                let bytes = set.bytes;
                if self.control.pending.push(set).is_err() {
                    warn!("{}: pending queue full, dropping capture", self.control.name);
                }
                self.failures = 0;
                self.emit(AcqEvent::Downloaded {
                    instrument: self.id,
                    bytes,
                });
                match self.mode {
                    TriggerMode::Single => {
                        self.set_state(AcquisitionState::Idle);
                        Step::Continue
                    }
                    TriggerMode::Continuous => match self.instrument.arm(self.mode) {
                        Ok(()) => {
                            self.set_state(AcquisitionState::Armed);
                            Step::Continue
                        }
                        Err(e) => self.transport_failure(e),
                    },
                }
            }
            Err(e) => self.transport_failure(e),
        }
    }

    /// Count a transport error. Returns true once the instrument has been
    /// marked disconnected.
    fn record_failure(&mut self, e: &InstrumentError) -> bool {
        self.failures += 1;
        self.emit(AcqEvent::Error {
            instrument: self.id,
            message: e.to_string(),
        });
        if self.failures >= self.settings.failure_threshold {
            error!(
                "{}: {} consecutive failures, last: {}; marking disconnected",
                self.control.name, self.failures, e
            );
            self.set_state(AcquisitionState::Disconnected);
            true
        } else {
            warn!(
                "{}: {} (failure {}/{}), retrying",
                self.control.name, e, self.failures, self.settings.failure_threshold
            );
            false
        }
    }

    fn transport_failure(&mut self, e: InstrumentError) -> Step {
        if self.record_failure(&e) {
            return Step::Sleep(self.settings.poll_interval);
        }
        // The trigger request stays in place; poll again after a pause.
        self.set_state(AcquisitionState::Armed);
        let wait = self.backoff;
        self.backoff = (self.backoff * 2).min(self.settings.max_backoff);
        Step::Sleep(wait)
    }

    fn handle_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                ControlRequest::Arm(mode) => {
                    if self.state == AcquisitionState::Disconnected {
                        warn!("{}: ignoring arm while disconnected", self.control.name);
                        continue;
                    }
                    match self.instrument.arm(mode) {
                        Ok(()) => {
                            self.mode = mode;
                            self.backoff = self.settings.poll_interval;
                            self.set_state(AcquisitionState::Armed);
                        }
                        Err(e) => {
                            // The instrument did not take the request; stay where we were.
                            self.record_failure(&e);
                        }
                    }
                }
                ControlRequest::Stop => {
                    if let Err(e) = self.instrument.stop() {
                        warn!("{}: stop failed: {}", self.control.name, e);
                    }
                    if self.state != AcquisitionState::Disconnected {
                        self.set_state(AcquisitionState::Idle);
                    }
                }
                ControlRequest::Reconnect => {
                    if self.state != AcquisitionState::Disconnected {
                        continue;
                    }
                    match self.instrument.reconnect() {
                        Ok(()) => {
                            info!("{}: reconnected", self.control.name);
                            self.failures = 0;
                            self.backoff = self.settings.poll_interval;
                            self.set_state(AcquisitionState::Idle);
                        }
                        Err(e) => error!("{}: reconnect failed: {}", self.control.name, e),
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: AcquisitionState) {
        if self.state == state {
            return;
        }
        debug!("{}: {} -> {}", self.control.name, self.state.label(), state.label());
        self.state = state;
        self.control.set_state(state);
        self.emit(AcqEvent::StateChanged {
            instrument: self.id,
            state,
        });
    }

    fn emit(&self, event: AcqEvent) {
        if let Some(tx) = &self.events {
            // Statistics only: drop when nobody drains the channel.
            let _ = tx.try_send(event);
        }
    }
}
