use crate::error::InstrumentError;
use crate::waveform::{StreamKind, UniformAnalogWaveform, Waveform};
use ndarray::Array2;
use serde::Deserialize;

/// Index of an instrument in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentId(pub usize);

/// Result of asking an instrument whether it has triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    Idle,
    Armed,
    Triggered,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Capture once, then go idle.
    Single,
    /// Re-arm after every capture.
    Continuous,
}

/// Static description of one instrument channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub kind: StreamKind,
}

/// One capture as the driver delivers it: raw ADC codes, one row per channel.
#[derive(Debug, Clone)]
pub struct RawCapture {
    /// Instrument channel index for each row of `codes`.
    pub channels: Vec<usize>,
    /// ADC codes with shape (channels, samples).
    pub codes: Array2<i16>,
    /// Volts per code, per row.
    pub gain: Vec<f32>,
    /// Volts added after scaling, per row.
    pub offset: Vec<f32>,
    /// Sample period in femtoseconds.
    pub timescale: i64,
    pub trigger_phase: i64,
    pub start_timestamp: i64,
    pub start_femtoseconds: i64,
}

impl RawCapture {
    /// Size of the raw block as it came over the transport.
    pub fn byte_size(&self) -> usize {
        self.codes.len() * std::mem::size_of::<i16>()
    }

    /// Scale every row into volts.
    pub fn into_waveform_set(self) -> WaveformSet {
        let bytes = self.byte_size();
        let waveforms = self
            .codes
            .outer_iter()
            .enumerate()
            .map(|(row, codes)| {
                let gain = self.gain.get(row).copied().unwrap_or(1.0);
                let offset = self.offset.get(row).copied().unwrap_or(0.0);
                let clipped = codes.iter().any(|&c| c == i16::MIN || c == i16::MAX);
                let volts = codes.iter().map(|&c| c as f32 * gain + offset).collect();

                let mut wfm = UniformAnalogWaveform::from_samples(self.timescale, volts);
                wfm.header.trigger_phase = self.trigger_phase;
                wfm.header.start_timestamp = self.start_timestamp;
                wfm.header.start_femtoseconds = self.start_femtoseconds;
                wfm.header.clipped = clipped;
                (self.channels.get(row).copied().unwrap_or(row), Waveform::from(wfm))
            })
            .collect();
        WaveformSet { waveforms, bytes }
    }
}

/// Converted waveforms from one capture, keyed by instrument channel index.
#[derive(Debug, Clone)]
pub struct WaveformSet {
    pub waveforms: Vec<(usize, Waveform)>,
    pub bytes: usize,
}

/// What the acquisition core needs from an instrument driver.
///
/// Drivers own their transport; the core only sequences these calls from the
/// instrument's own thread.
pub trait Instrument: Send {
    fn name(&self) -> &str;

    fn channel_count(&self) -> usize;

    fn channel(&self, index: usize) -> Option<ChannelInfo>;

    /// Request a trigger.
    fn arm(&mut self, mode: TriggerMode) -> Result<(), InstrumentError>;

    fn stop(&mut self) -> Result<(), InstrumentError>;

    fn poll_trigger(&mut self) -> Result<TriggerStatus, InstrumentError>;

    /// Pull the captured data. `progress` receives values in 0..=1.
    fn acquire_data(
        &mut self,
        progress: &mut dyn FnMut(f32),
    ) -> Result<RawCapture, InstrumentError>;

    /// Re-open the transport after the instrument was marked disconnected.
    fn reconnect(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn raw_capture_scales_rows() {
        let raw = RawCapture {
            channels: vec![0, 2],
            codes: array![[0i16, 10, -10], [i16::MAX, 1, 2]],
            gain: vec![0.5, 1.0],
            offset: vec![1.0, 0.0],
            timescale: 1_000,
            trigger_phase: 7,
            start_timestamp: 0,
            start_femtoseconds: 0,
        };
        assert_eq!(raw.byte_size(), 12);

        let set = raw.into_waveform_set();
        assert_eq!(set.bytes, 12);
        assert_eq!(set.waveforms.len(), 2);

        let (ch, w) = &set.waveforms[0];
        assert_eq!(*ch, 0);
        let w = w.as_uniform_analog().unwrap();
        assert_eq!(w.samples.as_slice(), &[1.0, 6.0, -4.0]);
        assert_eq!(w.header.trigger_phase, 7);
        assert!(!w.header.clipped);

        let (ch, w) = &set.waveforms[1];
        assert_eq!(*ch, 2);
        assert!(w.header().clipped);
    }
}
