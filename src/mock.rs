//! A simulated instrument with scripted trigger behaviour and synthetic signals.

use crate::error::InstrumentError;
use crate::instrument::{ChannelInfo, Instrument, RawCapture, TriggerMode, TriggerStatus};
use crate::waveform::{StreamKind, FS_PER_SECOND};
use ndarray::Array2;
use rand::Rng;
use serde::Deserialize;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Volts per ADC code of the simulated front end.
const VOLTS_PER_CODE: f32 = 1.0 / 4096.0;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum SignalShape {
    Zero,
    Sine,
    Square,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SignalSettings {
    pub shape: SignalShape,
    #[serde(default = "default_frequency")]
    pub frequency_hz: f64,
    #[serde(default = "default_amplitude")]
    pub amplitude: f32,
    #[serde(default)]
    pub noise: f32,
}

fn default_frequency() -> f64 {
    1.0e6
}

fn default_amplitude() -> f32 {
    1.0
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            shape: SignalShape::Sine,
            frequency_hz: default_frequency(),
            amplitude: default_amplitude(),
            noise: 0.0,
        }
    }
}

/// Counters shared with whoever created the mock, readable after it has
/// moved into its acquisition thread.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub polls: AtomicUsize,
    pub downloads: AtomicUsize,
    pub arms: AtomicUsize,
}

pub struct MockInstrument {
    name: String,
    channels: Vec<ChannelInfo>,
    record_len: usize,
    timescale: i64,
    signal: SignalSettings,
    poll_script: VecDeque<Result<TriggerStatus, InstrumentError>>,
    after_script: TriggerStatus,
    download_script: VecDeque<Result<(), InstrumentError>>,
    arm_script: VecDeque<Result<(), InstrumentError>>,
    fail_every: Option<usize>,
    armed: bool,
    captures: usize,
    counters: Arc<MockCounters>,
}

impl MockInstrument {
    /// `channels` analog channels named `CH1..`, `record_len` samples per
    /// capture, `timescale` femtoseconds per sample. Triggers on every poll.
    pub fn new(name: impl Into<String>, channels: usize, record_len: usize, timescale: i64) -> Self {
        Self {
            name: name.into(),
            channels: (1..=channels)
                .map(|i| ChannelInfo {
                    name: format!("CH{}", i),
                    kind: StreamKind::Analog,
                })
                .collect(),
            record_len,
            timescale,
            signal: SignalSettings::default(),
            poll_script: VecDeque::new(),
            after_script: TriggerStatus::Triggered,
            download_script: VecDeque::new(),
            arm_script: VecDeque::new(),
            fail_every: None,
            armed: false,
            captures: 0,
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub fn with_signal(mut self, signal: SignalSettings) -> Self {
        self.signal = signal;
        self
    }

    /// Answer polls from `script` first, then with `then` forever.
    pub fn with_poll_script(
        mut self,
        script: Vec<Result<TriggerStatus, InstrumentError>>,
        then: TriggerStatus,
    ) -> Self {
        self.poll_script = script.into();
        self.after_script = then;
        self
    }

    /// Outcomes for the next downloads; later downloads succeed.
    pub fn with_download_script(mut self, script: Vec<Result<(), InstrumentError>>) -> Self {
        self.download_script = script.into();
        self
    }

    /// Outcomes for the next arm requests; later ones succeed.
    pub fn with_arm_script(mut self, script: Vec<Result<(), InstrumentError>>) -> Self {
        self.arm_script = script.into();
        self
    }

    /// Fail every `n`th download with a transport error.
    pub fn fail_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    fn synthesize(&self, phase_offset: f64) -> Vec<i16> {
        let mut rng = rand::rng();
        let dt = self.timescale as f64 / FS_PER_SECOND as f64;
        (0..self.record_len)
            .map(|i| {
                let phase = 2.0 * PI * self.signal.frequency_hz * (i as f64 * dt) + phase_offset;
                let clean = match self.signal.shape {
                    SignalShape::Zero => 0.0,
                    SignalShape::Sine => phase.sin() as f32,
                    SignalShape::Square => {
                        if phase.sin() >= 0.0 {
                            1.0
                        } else {
                            -1.0
                        }
                    }
                };
                let noise = if self.signal.noise > 0.0 {
                    rng.random_range(-self.signal.noise..self.signal.noise)
                } else {
                    0.0
                };
                let volts = clean * self.signal.amplitude + noise;
                (volts / VOLTS_PER_CODE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
            })
            .collect()
    }
}

impl Instrument for MockInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, index: usize) -> Option<ChannelInfo> {
        self.channels.get(index).cloned()
    }

    fn arm(&mut self, _mode: TriggerMode) -> Result<(), InstrumentError> {
        if let Some(Err(e)) = self.arm_script.pop_front() {
            return Err(e);
        }
        self.armed = true;
        self.counters.arms.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), InstrumentError> {
        self.armed = false;
        Ok(())
    }

    fn poll_trigger(&mut self) -> Result<TriggerStatus, InstrumentError> {
        self.counters.polls.fetch_add(1, Ordering::Relaxed);
        if !self.armed {
            return Ok(TriggerStatus::Idle);
        }
        self.poll_script.pop_front().unwrap_or(Ok(self.after_script))
    }

    fn acquire_data(
        &mut self,
        progress: &mut dyn FnMut(f32),
    ) -> Result<RawCapture, InstrumentError> {
        self.captures += 1;
        if let Some(Err(e)) = self.download_script.pop_front() {
            return Err(e);
        }
        if let Some(n) = self.fail_every {
            if self.captures % n == 0 {
                return Err(InstrumentError::Transport(format!(
                    "{}: simulated link drop on capture {}",
                    self.name, self.captures
                )));
            }
        }

        let n_channels = self.channels.len();
        let mut codes = Array2::<i16>::zeros((n_channels, self.record_len));
        for (ch, mut row) in codes.outer_iter_mut().enumerate() {
            let phase = ch as f64 * PI / 2.0;
            for (dst, src) in row.iter_mut().zip(self.synthesize(phase)) {
                *dst = src;
            }
            progress((ch + 1) as f32 / n_channels as f32);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(RawCapture {
            channels: (0..n_channels).collect(),
            codes,
            gain: vec![VOLTS_PER_CODE; n_channels],
            offset: vec![0.0; n_channels],
            timescale: self.timescale,
            trigger_phase: 0,
            start_timestamp: now.as_secs() as i64,
            start_femtoseconds: now.subsec_nanos() as i64 * 1_000_000,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_script_then_default() {
        let mut m = MockInstrument::new("m", 1, 4, 1_000).with_poll_script(
            vec![Ok(TriggerStatus::Armed), Err(InstrumentError::Timeout)],
            TriggerStatus::Idle,
        );
        assert_eq!(m.poll_trigger(), Ok(TriggerStatus::Idle)); // not armed yet
        m.arm(TriggerMode::Continuous).unwrap();
        assert_eq!(m.poll_trigger(), Ok(TriggerStatus::Armed));
        assert_eq!(m.poll_trigger(), Err(InstrumentError::Timeout));
        assert_eq!(m.poll_trigger(), Ok(TriggerStatus::Idle));
        assert_eq!(m.counters().polls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn zero_signal_downloads_zeros() {
        let mut m = MockInstrument::new("m", 2, 10, 1_000).with_signal(SignalSettings {
            shape: SignalShape::Zero,
            ..Default::default()
        });
        let mut last = 0.0;
        let raw = m.acquire_data(&mut |p| last = p).unwrap();
        assert_eq!(last, 1.0);
        assert_eq!(raw.codes.dim(), (2, 10));
        assert!(raw.codes.iter().all(|&c| c == 0));
    }

    #[test]
    fn fail_every_nth() {
        let mut m = MockInstrument::new("m", 1, 4, 1_000).fail_every(2);
        assert!(m.acquire_data(&mut |_| {}).is_ok());
        assert!(matches!(
            m.acquire_data(&mut |_| {}),
            Err(InstrumentError::Transport(_))
        ));
        assert!(m.acquire_data(&mut |_| {}).is_ok());
        assert_eq!(m.counters().downloads.load(Ordering::Relaxed), 2);
    }
}
