//! A running scope session: instruments, their channel slots, the filter graph
//! and the threads that connect them.
//!
//! One acquisition thread runs per instrument, plus one handoff thread that
//! publishes captures into the channel table. The thread that owns the
//! `Session` plays the processing role and drives the filter graph through
//! [`Session::poll_cycle`] or [`Session::wait_cycle`].

use crate::acquisition::{
    AcqEvent, AcquisitionSettings, AcquisitionState, ControlRequest, InstrumentControl,
    InstrumentWorker,
};
use crate::channel::ChannelTable;
use crate::config::Conf;
use crate::error::{ConfigError, FilterError, GraphError};
use crate::event::ShutdownFlag;
use crate::filter::{
    detect_simd, Capabilities, ExecutionContext, ExecutionReport, Filter, FilterGraph,
    FilterGraphExecutor,
};
use crate::filters::FilterRegistry;
use crate::handoff::{lock_table, Handshake, WaveformHandoff};
use crate::instrument::{Instrument, InstrumentId, TriggerMode};
use crate::mock::MockInstrument;
use crate::stream::{ChannelId, FilterId, StreamDescriptor, StreamOwner};
use crate::waveform::Waveform;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Acquisition events kept for the UI before new ones are dropped.
pub const EVENT_CAPACITY: usize = 1024;

struct InstrumentEntry {
    name: String,
    control: Arc<InstrumentControl>,
    /// Taken when the acquisition thread starts.
    worker: Option<InstrumentWorker>,
}

/// A filter that reduces its input to one number, as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementReading {
    pub filter: FilterId,
    pub name: String,
    pub value: Option<f64>,
    pub unit: &'static str,
}

pub struct Session {
    channels: Arc<Mutex<ChannelTable>>,
    graph: FilterGraph,
    executor: FilterGraphExecutor,
    ctx: ExecutionContext,
    settings: AcquisitionSettings,
    trigger_mode: TriggerMode,
    handshake: Arc<Handshake>,
    shutdown: ShutdownFlag,
    instruments: Vec<InstrumentEntry>,
    tx_events: Sender<AcqEvent>,
    rx_events: Receiver<AcqEvent>,
    threads: Vec<JoinHandle<()>>,
    last_report: Option<ExecutionReport>,
    cycles: u64,
}

impl Session {
    pub fn new(settings: AcquisitionSettings, caps: Capabilities) -> Self {
        let (tx_events, rx_events) = bounded(EVENT_CAPACITY);
        Self {
            channels: Arc::new(Mutex::new(ChannelTable::new())),
            graph: FilterGraph::new(),
            executor: FilterGraphExecutor::new(),
            ctx: ExecutionContext::new(caps),
            settings,
            trigger_mode: TriggerMode::Continuous,
            handshake: Arc::new(Handshake::default()),
            shutdown: ShutdownFlag::new(),
            instruments: Vec::new(),
            tx_events,
            rx_events,
            threads: Vec::new(),
            last_report: None,
            cycles: 0,
        }
    }

    /// Keep at most `capacity` undrained acquisition events. Call before
    /// adding instruments.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (tx_events, rx_events) = bounded(capacity);
        self.tx_events = tx_events;
        self.rx_events = rx_events;
        self
    }

    /// Build instruments and the filter graph described by `conf`.
    ///
    /// All filters are created before any input is bound, so a filter may
    /// read from one declared after it.
    pub fn from_config(conf: &Conf, registry: &FilterRegistry) -> Result<Self, ConfigError> {
        let caps = Capabilities {
            gpu_filters: conf.compute.gpu_filters,
            simd: conf.compute.simd.unwrap_or_else(detect_simd),
        };
        let mut session = Session::new(AcquisitionSettings::from(&conf.acquisition), caps);
        session.trigger_mode = conf.acquisition.trigger_mode;

        for inst in &conf.instruments {
            let mut mock = MockInstrument::new(
                inst.name.clone(),
                inst.channels,
                inst.record_len,
                inst.sample_period_fs,
            )
            .with_signal(inst.signal);
            if let Some(n) = inst.fail_every {
                mock = mock.fail_every(n);
            }
            session.add_instrument(Box::new(mock))?;
        }

        let mut ids = Vec::with_capacity(conf.filters.len());
        for fc in &conf.filters {
            let mut filter = registry
                .create(&fc.kind)
                .ok_or_else(|| ConfigError::UnknownFilterKind(fc.kind.clone()))?;
            for (name, value) in &fc.params {
                filter.parameters_mut().parse_and_set(name, &value.to_string())?;
            }
            let id = session.add_filter(fc.name.clone(), filter)?;
            session.graph.set_gpu_enabled(id, fc.gpu)?;
            ids.push(id);
        }

        for (fc, &id) in conf.filters.iter().zip(&ids) {
            for (input, reference) in &fc.inputs {
                let source = session.resolve(reference)?;
                session.bind_input(id, input, source)?;
            }
        }

        info!(
            "Session built: {} instruments, {} channels, {} filters",
            session.instruments.len(),
            session.with_channels(|t| t.len()),
            session.graph.len()
        );
        Ok(session)
    }

    /// Register an instrument and one channel slot per instrument channel,
    /// named `instrument:channel`. Call before [`start`](Session::start).
    pub fn add_instrument(
        &mut self,
        instrument: Box<dyn Instrument>,
    ) -> Result<InstrumentId, ConfigError> {
        let name = instrument.name().to_string();
        if self.instruments.iter().any(|e| e.name == name) {
            return Err(ConfigError::DuplicateName(name));
        }
        let id = InstrumentId(self.instruments.len());
        {
            let mut table = lock_table(&self.channels);
            for index in 0..instrument.channel_count() {
                if let Some(info) = instrument.channel(index) {
                    table.add_channel(
                        format!("{}:{}", name, info.name),
                        id,
                        index,
                        &[("data", info.kind)],
                    );
                }
            }
        }
        let (worker, control) = InstrumentWorker::new(id, instrument, self.settings);
        let worker = worker.with_events(self.tx_events.clone());
        self.instruments.push(InstrumentEntry {
            name,
            control,
            worker: Some(worker),
        });
        Ok(id)
    }

    pub fn add_filter(
        &mut self,
        name: impl Into<String>,
        filter: Box<dyn Filter>,
    ) -> Result<FilterId, ConfigError> {
        let name = name.into();
        if self.graph.find(&name).is_some() {
            return Err(ConfigError::DuplicateName(name));
        }
        Ok(self.graph.create(name, filter))
    }

    pub fn bind_input(
        &mut self,
        filter: FilterId,
        input: &str,
        source: StreamDescriptor,
    ) -> Result<(), GraphError> {
        let table = lock_table(&self.channels);
        self.graph.set_input_by_name(filter, input, source, &table)
    }

    /// Drop the session's own reference to a filter. Returns whether it was
    /// destroyed.
    pub fn release_filter(&mut self, filter: FilterId) -> Result<bool, GraphError> {
        self.graph.release(filter)
    }

    pub fn set_parameter(
        &mut self,
        filter: FilterId,
        name: &str,
        text: &str,
    ) -> Result<(), FilterError> {
        let node = self
            .graph
            .node_mut(filter)
            .ok_or_else(|| FilterError::Unsupported(format!("no filter {:?}", filter)))?;
        node.filter_mut().parameters_mut().parse_and_set(name, text)
    }

    pub fn set_always_recompute(&mut self, always: bool) {
        self.executor.always_recompute = always;
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) {
        self.trigger_mode = mode;
    }

    /// Resolve `instrument:channel`, `filter` or `filter.stream`.
    pub fn resolve(&self, reference: &str) -> Result<StreamDescriptor, ConfigError> {
        if let Some(ch) = self.channel(reference) {
            return Ok(StreamDescriptor::channel(ch, 0));
        }
        let unresolved = || ConfigError::UnresolvedStream(reference.to_string());
        let target = reference.strip_prefix("filter:").unwrap_or(reference);
        if let Some(id) = self.graph.find(target) {
            return Ok(StreamDescriptor::filter(id, 0));
        }
        let (name, stream) = target.rsplit_once('.').ok_or_else(unresolved)?;
        let id = self.graph.find(name).ok_or_else(unresolved)?;
        let outputs = self.graph.node(id).ok_or_else(unresolved)?.outputs();
        let index = match stream.parse::<usize>() {
            Ok(i) if i < outputs.len() => i,
            Ok(_) => return Err(unresolved()),
            Err(_) => outputs.find(stream).ok_or_else(unresolved)?,
        };
        Ok(StreamDescriptor::filter(id, index))
    }

    pub fn channel(&self, name: &str) -> Option<ChannelId> {
        lock_table(&self.channels).find(name)
    }

    /// Spawn every acquisition thread and the handoff thread.
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let mut controls = Vec::with_capacity(self.instruments.len());
        for (i, entry) in self.instruments.iter_mut().enumerate() {
            controls.push((InstrumentId(i), Arc::clone(&entry.control)));
            let Some(worker) = entry.worker.take() else {
                continue;
            };
            let shutdown = self.shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("acq-{}", entry.name))
                .spawn(move || worker.run(shutdown))?;
            self.threads.push(handle);
        }

        let handoff = WaveformHandoff::new(
            controls,
            Arc::clone(&self.channels),
            Arc::clone(&self.handshake),
            self.settings.poll_interval,
        );
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("handoff".to_string())
            .spawn(move || handoff.run(shutdown))?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    fn control(&self, id: InstrumentId) -> Option<&InstrumentControl> {
        self.instruments.get(id.0).map(|e| e.control.as_ref())
    }

    pub fn arm(&self, id: InstrumentId, mode: TriggerMode) {
        if let Some(control) = self.control(id) {
            control.request(ControlRequest::Arm(mode));
        }
    }

    /// Arm every instrument in the configured trigger mode.
    pub fn arm_all(&self) {
        for entry in &self.instruments {
            entry.control.request(ControlRequest::Arm(self.trigger_mode));
        }
    }

    pub fn stop(&self, id: InstrumentId) {
        if let Some(control) = self.control(id) {
            control.request(ControlRequest::Stop);
        }
    }

    pub fn stop_all(&self) {
        for entry in &self.instruments {
            entry.control.request(ControlRequest::Stop);
        }
    }

    pub fn reconnect(&self, id: InstrumentId) {
        if let Some(control) = self.control(id) {
            control.request(ControlRequest::Reconnect);
        }
    }

    /// Ask every disconnected instrument to reconnect.
    pub fn reconnect_all(&self) {
        for entry in &self.instruments {
            if entry.control.state() == AcquisitionState::Disconnected {
                entry.control.request(ControlRequest::Reconnect);
            }
        }
    }

    pub fn instrument_state(&self, id: InstrumentId) -> Option<AcquisitionState> {
        self.control(id).map(|c| c.state())
    }

    pub fn instruments(&self) -> impl Iterator<Item = (InstrumentId, &str, AcquisitionState)> + '_ {
        self.instruments
            .iter()
            .enumerate()
            .map(|(i, e)| (InstrumentId(i), e.name.as_str(), e.control.state()))
    }

    /// Whether a capture can still arrive without further requests: some
    /// instrument is acquiring, holds an undelivered capture or has a control
    /// request queued.
    pub fn has_work(&self) -> bool {
        self.instruments.iter().any(|e| {
            e.control.state().is_active() || !e.control.pending.is_empty() || e.control.has_requests()
        })
    }

    /// Run the graph if new captures were published, without waiting.
    pub fn poll_cycle(&mut self) -> Option<Result<ExecutionReport, GraphError>> {
        if !self.handshake.ready.peek() {
            return None;
        }
        Some(self.process_and_release())
    }

    /// Wait up to `timeout` for new captures, then run the graph.
    pub fn wait_cycle(&mut self, timeout: Duration) -> Option<Result<ExecutionReport, GraphError>> {
        if !self.handshake.ready.block_timeout(timeout) {
            return None;
        }
        Some(self.process_and_release())
    }

    fn process_and_release(&mut self) -> Result<ExecutionReport, GraphError> {
        let result = self.process();
        // Release the handoff thread even when the graph is unusable.
        self.handshake.processed.signal();
        result
    }

    /// Run the filter graph once over the current channel table.
    pub fn process(&mut self) -> Result<ExecutionReport, GraphError> {
        let report = {
            let mut table = lock_table(&self.channels);
            self.executor.run_blocking(&mut self.graph, &mut table, &mut self.ctx)?
        };
        self.cycles += 1;
        self.last_report = Some(report.clone());
        Ok(report)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn last_report(&self) -> Option<&ExecutionReport> {
        self.last_report.as_ref()
    }

    /// A CPU-readable copy of the latest waveform on a stream.
    pub fn latest(&self, source: StreamDescriptor) -> Option<Waveform> {
        let mut waveform = match source.owner {
            StreamOwner::Channel(ch) => lock_table(&self.channels).waveform(ch, source.stream)?.clone(),
            StreamOwner::Filter(_) => self.graph.data(source)?.clone(),
        };
        waveform.prepare_for_cpu_access();
        Some(waveform)
    }

    pub fn measurements(&self) -> Vec<MeasurementReading> {
        self.graph
            .ids()
            .into_iter()
            .filter_map(|id| {
                let node = self.graph.node(id)?;
                let m = node.filter().as_measurement()?;
                Some(MeasurementReading {
                    filter: id,
                    name: node.name().to_string(),
                    value: m.value(),
                    unit: m.unit(),
                })
            })
            .collect()
    }

    pub fn events(&self) -> &Receiver<AcqEvent> {
        &self.rx_events
    }

    pub fn graph(&self) -> &FilterGraph {
        &self.graph
    }

    pub fn capabilities(&self) -> Capabilities {
        self.ctx.caps
    }

    pub fn with_channels<R>(&self, f: impl FnOnce(&ChannelTable) -> R) -> R {
        f(&lock_table(&self.channels))
    }

    /// Stop every thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shutdown.request();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!("Thread {} panicked", name);
            }
        }
        info!("Session stopped after {} cycles", self.cycles);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ComputeConf, FilterConf, InstrumentConf, ParamText};
    use crate::mock::{SignalSettings, SignalShape};
    use std::collections::HashMap;
    use std::time::Instant;

    fn conf(filters: Vec<FilterConf>) -> Conf {
        Conf {
            acquisition: crate::config::AcquisitionConf {
                poll_interval_ms: 1,
                max_backoff_ms: 2,
                failure_threshold: 5,
                max_pending: 2,
                trigger_mode: TriggerMode::Continuous,
            },
            compute: ComputeConf {
                gpu_filters: false,
                simd: Some(false),
            },
            logging: crate::config::LoggingConf {
                level: "info".into(),
                dir: ".".into(),
            },
            instruments: vec![InstrumentConf {
                name: "scope".into(),
                channels: 2,
                record_len: 10,
                sample_period_fs: 1_000_000,
                signal: SignalSettings {
                    shape: SignalShape::Zero,
                    ..Default::default()
                },
                fail_every: None,
            }],
            filters,
        }
    }

    fn filter(name: &str, kind: &str, inputs: &[(&str, &str)]) -> FilterConf {
        FilterConf {
            name: name.into(),
            kind: kind.into(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            params: HashMap::new(),
            gpu: true,
        }
    }

    #[test]
    fn builds_graph_from_config() {
        let mut scaled = filter("scaled", "scale", &[("in", "diff")]);
        scaled.params.insert("gain".into(), ParamText::Float(2.0));
        let conf = conf(vec![
            scaled,
            filter("diff", "subtract", &[("A", "scope:CH1"), ("B", "scope:CH2")]),
            filter("level", "rms", &[("in", "scaled.data")]),
        ]);
        let session = Session::from_config(&conf, &FilterRegistry::with_builtin()).unwrap();

        assert_eq!(session.with_channels(|t| t.len()), 2);
        assert_eq!(session.graph().len(), 3);
        let diff = session.graph().find("diff").unwrap();
        let scaled = session.graph().find("scaled").unwrap();
        // Held by the session and by "scaled".
        assert_eq!(session.graph().node(diff).unwrap().refcount(), 2);
        assert_eq!(
            session.graph().node(scaled).unwrap().filter().parameters().float("gain").unwrap(),
            2.0
        );
        assert_eq!(session.measurements().len(), 1);
        assert!(!session.capabilities().gpu_filters);
    }

    #[test]
    fn config_errors() {
        let registry = FilterRegistry::with_builtin();

        let bad_kind = conf(vec![filter("x", "nope", &[])]);
        assert!(matches!(
            Session::from_config(&bad_kind, &registry),
            Err(ConfigError::UnknownFilterKind(_))
        ));

        let bad_ref = conf(vec![filter("x", "rms", &[("in", "scope:CH9")])]);
        assert!(matches!(
            Session::from_config(&bad_ref, &registry),
            Err(ConfigError::UnresolvedStream(_))
        ));

        let dup = conf(vec![filter("x", "rms", &[]), filter("x", "rms", &[])]);
        assert!(matches!(
            Session::from_config(&dup, &registry),
            Err(ConfigError::DuplicateName(_))
        ));

        let mut bad_param = filter("x", "scale", &[]);
        bad_param.params.insert("gain".into(), ParamText::Text("fast".into()));
        assert!(matches!(
            Session::from_config(&conf(vec![bad_param]), &registry),
            Err(ConfigError::Filter(FilterError::BadParameter { .. }))
        ));
    }

    #[test]
    fn resolve_stream_by_index_and_name() {
        let conf = conf(vec![filter("spectrum", "fft", &[("in", "scope:CH1")])]);
        let session = Session::from_config(&conf, &FilterRegistry::with_builtin()).unwrap();
        let id = session.graph().find("spectrum").unwrap();
        assert_eq!(session.resolve("spectrum").unwrap(), StreamDescriptor::filter(id, 0));
        assert_eq!(session.resolve("spectrum.0").unwrap(), StreamDescriptor::filter(id, 0));
        assert_eq!(
            session.resolve("spectrum.magnitude").unwrap(),
            StreamDescriptor::filter(id, 0)
        );
        assert_eq!(
            session.resolve("filter:spectrum.magnitude").unwrap(),
            StreamDescriptor::filter(id, 0)
        );
        assert!(session.resolve("spectrum.7").is_err());
        assert!(session.resolve("missing.0").is_err());
    }

    #[test]
    fn threaded_cycles_reach_the_graph() {
        let conf = conf(vec![filter(
            "diff",
            "subtract",
            &[("A", "scope:CH1"), ("B", "scope:CH2")],
        )]);
        let mut session = Session::from_config(&conf, &FilterRegistry::with_builtin()).unwrap();
        let diff = session.graph().find("diff").unwrap();
        session.start().unwrap();
        session.arm_all();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut processed = 0;
        while processed < 3 && Instant::now() < deadline {
            if let Some(report) = session.wait_cycle(Duration::from_millis(50)) {
                let report = report.unwrap();
                assert!(report.failed.is_empty());
                processed += 1;
            }
        }
        assert_eq!(processed, 3);

        let out = session.latest(StreamDescriptor::filter(diff, 0)).unwrap();
        assert_eq!(out.analog_samples().unwrap().as_slice(), &[0.0; 10]);
        assert!(session.events().try_iter().any(|e| matches!(e, AcqEvent::Downloaded { .. })));

        session.shutdown();
        assert!(!session.is_running());
    }

    #[test]
    fn undrained_events_stay_bounded() {
        let settings = AcquisitionSettings {
            poll_interval: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            failure_threshold: 5,
            max_pending: 2,
        };
        let mut session = Session::new(settings, Capabilities::cpu_only()).with_event_capacity(8);
        session
            .add_instrument(Box::new(MockInstrument::new("scope", 1, 16, 1_000)))
            .unwrap();
        assert!(!session.has_work());
        session.start().unwrap();
        session.arm_all();
        assert!(session.has_work());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut processed = 0;
        while processed < 20 && Instant::now() < deadline {
            if session.wait_cycle(Duration::from_millis(50)).is_some() {
                processed += 1;
            }
        }
        assert_eq!(processed, 20);
        assert_eq!(session.events().len(), 8);
        session.shutdown();
    }
}
