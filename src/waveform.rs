//! Captured and derived waveform data.
//!
//! Times are integers in femtoseconds. A uniform waveform's sample `i` sits at
//! `i * timescale + trigger_phase`; a sparse waveform stores explicit offsets
//! and durations (in units of `timescale`) next to its samples.

use crate::buffer::AcceleratorBuffer;
use crate::error::WaveformError;

pub const FS_PER_SECOND: i64 = 1_000_000_000_000_000;

/// Data type carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Analog,
    Digital,
}

impl StreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Analog => "analog",
            StreamKind::Digital => "digital",
        }
    }
}

/// Timebase and bookkeeping shared by every waveform flavour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveformHeader {
    /// Femtoseconds per sample index (uniform) or per offset unit (sparse).
    pub timescale: i64,
    /// Sub-sample offset of the first sample, in femtoseconds.
    pub trigger_phase: i64,
    /// Capture start, whole seconds since the Unix epoch.
    pub start_timestamp: i64,
    /// Capture start, fractional part.
    pub start_femtoseconds: i64,
    /// At least one sample hit the ADC rails.
    pub clipped: bool,
    revision: u64,
}

impl WaveformHeader {
    pub fn with_timescale(timescale: i64) -> Self {
        Self {
            timescale,
            ..Default::default()
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Take over timescale, trigger phase and start time from another waveform.
    pub fn copy_timebase_from(&mut self, other: &WaveformHeader) {
        self.timescale = other.timescale;
        self.trigger_phase = other.trigger_phase;
        self.start_timestamp = other.start_timestamp;
        self.start_femtoseconds = other.start_femtoseconds;
    }

    fn bump_revision(&mut self) {
        self.revision += 1;
    }
}

/// Evenly spaced samples.
#[derive(Debug)]
pub struct UniformWaveform<T> {
    pub header: WaveformHeader,
    pub samples: AcceleratorBuffer<T>,
}

impl<T: Copy + Default> UniformWaveform<T> {
    pub fn new(timescale: i64) -> Self {
        Self {
            header: WaveformHeader::with_timescale(timescale),
            samples: AcceleratorBuffer::new(),
        }
    }

    /// Waveform holding `values`, already marked as a CPU write.
    pub fn from_samples(timescale: i64, values: Vec<T>) -> Self {
        let mut wfm = Self::new(timescale);
        wfm.samples = AcceleratorBuffer::from_vec(values);
        wfm.header.bump_revision();
        wfm
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn resize(&mut self, len: usize) {
        self.samples.resize(len);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn revision(&self) -> u64 {
        self.header.revision
    }

    pub fn sample_time(&self, index: usize) -> i64 {
        index as i64 * self.header.timescale + self.header.trigger_phase
    }

    pub fn prepare_for_cpu_access(&mut self) {
        self.samples.prepare_for_cpu_access();
    }

    pub fn prepare_for_gpu_access(&mut self) {
        self.samples.prepare_for_gpu_access();
    }

    pub fn mark_modified_from_cpu(&mut self) {
        self.samples.mark_modified_from_cpu();
        self.header.bump_revision();
    }

    pub fn mark_modified_from_gpu(&mut self) {
        self.samples.mark_modified_from_gpu();
        self.header.bump_revision();
    }
}

/// Samples with explicit start offsets and durations.
///
/// The three arrays always have equal length and offsets ascend without
/// overlapping: `offsets[i] >= offsets[i - 1] + durations[i - 1]`.
#[derive(Debug)]
pub struct SparseWaveform<T> {
    pub header: WaveformHeader,
    offsets: AcceleratorBuffer<i64>,
    durations: AcceleratorBuffer<i64>,
    samples: AcceleratorBuffer<T>,
}

impl<T: Copy + Default> SparseWaveform<T> {
    pub fn new(timescale: i64) -> Self {
        Self {
            header: WaveformHeader::with_timescale(timescale),
            offsets: AcceleratorBuffer::new(),
            durations: AcceleratorBuffer::new(),
            samples: AcceleratorBuffer::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.header.revision
    }

    pub fn offsets(&self) -> &AcceleratorBuffer<i64> {
        &self.offsets
    }

    pub fn durations(&self) -> &AcceleratorBuffer<i64> {
        &self.durations
    }

    pub fn samples(&self) -> &AcceleratorBuffer<T> {
        &self.samples
    }

    /// Append one sample after the current last one.
    pub fn push(&mut self, offset: i64, duration: i64, value: T) -> Result<(), WaveformError> {
        self.prepare_for_cpu_access();
        if let Some(last) = self.len().checked_sub(1) {
            let previous_end = self.offsets[last] + self.durations[last];
            if offset < previous_end {
                return Err(WaveformError::OffsetOrder {
                    index: last + 1,
                    offset,
                    previous_end,
                });
            }
        }
        self.offsets.push_back(offset);
        self.durations.push_back(duration);
        self.samples.push_back(value);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.durations.clear();
        self.samples.clear();
    }

    pub fn sample_time(&self, index: usize) -> i64 {
        self.offsets[index] * self.header.timescale + self.header.trigger_phase
    }

    /// Check the equal-length and ordering invariants.
    pub fn validate(&mut self) -> Result<(), WaveformError> {
        let (offsets, durations, samples) = (self.offsets.len(), self.durations.len(), self.samples.len());
        if offsets != durations || offsets != samples {
            return Err(WaveformError::LengthMismatch {
                offsets,
                durations,
                samples,
            });
        }
        self.offsets.prepare_for_cpu_access();
        self.durations.prepare_for_cpu_access();
        for i in 1..offsets {
            let previous_end = self.offsets[i - 1] + self.durations[i - 1];
            if self.offsets[i] < previous_end {
                return Err(WaveformError::OffsetOrder {
                    index: i,
                    offset: self.offsets[i],
                    previous_end,
                });
            }
        }
        Ok(())
    }

    pub fn prepare_for_cpu_access(&mut self) {
        self.offsets.prepare_for_cpu_access();
        self.durations.prepare_for_cpu_access();
        self.samples.prepare_for_cpu_access();
    }

    pub fn prepare_for_gpu_access(&mut self) {
        self.offsets.prepare_for_gpu_access();
        self.durations.prepare_for_gpu_access();
        self.samples.prepare_for_gpu_access();
    }

    pub fn mark_modified_from_cpu(&mut self) {
        self.offsets.mark_modified_from_cpu();
        self.durations.mark_modified_from_cpu();
        self.samples.mark_modified_from_cpu();
        self.header.bump_revision();
    }

    pub fn mark_modified_from_gpu(&mut self) {
        self.offsets.mark_modified_from_gpu();
        self.durations.mark_modified_from_gpu();
        self.samples.mark_modified_from_gpu();
        self.header.bump_revision();
    }
}

impl<T: Copy + Default> Clone for UniformWaveform<T> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            samples: self.samples.clone(),
        }
    }
}

impl<T: Copy + Default> Clone for SparseWaveform<T> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            offsets: self.offsets.clone(),
            durations: self.durations.clone(),
            samples: self.samples.clone(),
        }
    }
}

pub type UniformAnalogWaveform = UniformWaveform<f32>;
pub type UniformDigitalWaveform = UniformWaveform<bool>;
pub type SparseAnalogWaveform = SparseWaveform<f32>;
pub type SparseDigitalWaveform = SparseWaveform<bool>;

/// Any waveform a channel or filter output can hold.
#[derive(Debug, Clone)]
pub enum Waveform {
    UniformAnalog(UniformAnalogWaveform),
    SparseAnalog(SparseAnalogWaveform),
    UniformDigital(UniformDigitalWaveform),
    SparseDigital(SparseDigitalWaveform),
}

impl Waveform {
    pub fn header(&self) -> &WaveformHeader {
        match self {
            Waveform::UniformAnalog(w) => &w.header,
            Waveform::SparseAnalog(w) => &w.header,
            Waveform::UniformDigital(w) => &w.header,
            Waveform::SparseDigital(w) => &w.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut WaveformHeader {
        match self {
            Waveform::UniformAnalog(w) => &mut w.header,
            Waveform::SparseAnalog(w) => &mut w.header,
            Waveform::UniformDigital(w) => &mut w.header,
            Waveform::SparseDigital(w) => &mut w.header,
        }
    }

    pub fn revision(&self) -> u64 {
        self.header().revision
    }

    pub fn len(&self) -> usize {
        match self {
            Waveform::UniformAnalog(w) => w.len(),
            Waveform::SparseAnalog(w) => w.len(),
            Waveform::UniformDigital(w) => w.len(),
            Waveform::SparseDigital(w) => w.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Waveform::UniformAnalog(_) | Waveform::SparseAnalog(_) => StreamKind::Analog,
            Waveform::UniformDigital(_) | Waveform::SparseDigital(_) => StreamKind::Digital,
        }
    }

    pub fn is_uniform(&self) -> bool {
        matches!(self, Waveform::UniformAnalog(_) | Waveform::UniformDigital(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Waveform::UniformAnalog(_) => "uniform analog",
            Waveform::SparseAnalog(_) => "sparse analog",
            Waveform::UniformDigital(_) => "uniform digital",
            Waveform::SparseDigital(_) => "sparse digital",
        }
    }

    pub fn prepare_for_cpu_access(&mut self) {
        match self {
            Waveform::UniformAnalog(w) => w.prepare_for_cpu_access(),
            Waveform::SparseAnalog(w) => w.prepare_for_cpu_access(),
            Waveform::UniformDigital(w) => w.prepare_for_cpu_access(),
            Waveform::SparseDigital(w) => w.prepare_for_cpu_access(),
        }
    }

    pub fn prepare_for_gpu_access(&mut self) {
        match self {
            Waveform::UniformAnalog(w) => w.prepare_for_gpu_access(),
            Waveform::SparseAnalog(w) => w.prepare_for_gpu_access(),
            Waveform::UniformDigital(w) => w.prepare_for_gpu_access(),
            Waveform::SparseDigital(w) => w.prepare_for_gpu_access(),
        }
    }

    pub fn as_uniform_analog(&self) -> Option<&UniformAnalogWaveform> {
        match self {
            Waveform::UniformAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_uniform_analog_mut(&mut self) -> Option<&mut UniformAnalogWaveform> {
        match self {
            Waveform::UniformAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_sparse_analog(&self) -> Option<&SparseAnalogWaveform> {
        match self {
            Waveform::SparseAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_sparse_analog_mut(&mut self) -> Option<&mut SparseAnalogWaveform> {
        match self {
            Waveform::SparseAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_uniform_digital(&self) -> Option<&UniformDigitalWaveform> {
        match self {
            Waveform::UniformDigital(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_uniform_digital_mut(&mut self) -> Option<&mut UniformDigitalWaveform> {
        match self {
            Waveform::UniformDigital(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_sparse_digital(&self) -> Option<&SparseDigitalWaveform> {
        match self {
            Waveform::SparseDigital(w) => Some(w),
            _ => None,
        }
    }

    /// Analog sample values regardless of uniform or sparse layout.
    pub fn analog_samples(&self) -> Option<&AcceleratorBuffer<f32>> {
        match self {
            Waveform::UniformAnalog(w) => Some(&w.samples),
            Waveform::SparseAnalog(w) => Some(w.samples()),
            _ => None,
        }
    }
}

impl From<UniformAnalogWaveform> for Waveform {
    fn from(w: UniformAnalogWaveform) -> Self {
        Waveform::UniformAnalog(w)
    }
}

impl From<SparseAnalogWaveform> for Waveform {
    fn from(w: SparseAnalogWaveform) -> Self {
        Waveform::SparseAnalog(w)
    }
}

impl From<UniformDigitalWaveform> for Waveform {
    fn from(w: UniformDigitalWaveform) -> Self {
        Waveform::UniformDigital(w)
    }
}

impl From<SparseDigitalWaveform> for Waveform {
    fn from(w: SparseDigitalWaveform) -> Self {
        Waveform::SparseDigital(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sample_time_includes_trigger_phase() {
        let mut w = UniformAnalogWaveform::from_samples(1_000, vec![0.0; 4]);
        w.header.trigger_phase = 250;
        assert_eq!(w.sample_time(0), 250);
        assert_eq!(w.sample_time(3), 3_250);
    }

    #[test]
    fn cpu_modification_bumps_revision_once() {
        let mut w = UniformAnalogWaveform::new(1);
        assert_eq!(w.revision(), 0);
        w.resize(3);
        w.mark_modified_from_cpu();
        assert_eq!(w.revision(), 1);
        w.mark_modified_from_gpu();
        assert_eq!(w.revision(), 2);
    }

    #[test]
    fn sparse_push_rejects_overlap() {
        let mut w = SparseDigitalWaveform::new(10);
        w.push(0, 5, true).unwrap();
        w.push(5, 2, false).unwrap();
        let err = w.push(6, 1, true).unwrap_err();
        assert_eq!(
            err,
            WaveformError::OffsetOrder {
                index: 2,
                offset: 6,
                previous_end: 7
            }
        );
        assert_eq!(w.len(), 2);
        assert!(w.validate().is_ok());
        assert_eq!(w.sample_time(1), 50);
    }

    #[test]
    fn sparse_arrays_stay_aligned() {
        let mut w = SparseAnalogWaveform::new(1);
        w.push(0, 1, 1.0).unwrap();
        assert!(w.push(0, 1, 2.0).is_err());
        w.push(3, 2, 3.0).unwrap();
        assert_eq!(w.offsets().len(), 2);
        assert_eq!(w.durations().len(), 2);
        assert_eq!(w.samples().len(), 2);
        assert!(w.validate().is_ok());

        w.clear();
        assert!(w.offsets().is_empty() && w.durations().is_empty() && w.is_empty());
        assert!(w.validate().is_ok());
    }

    #[test]
    fn enum_queries_by_kind() {
        let w: Waveform = UniformDigitalWaveform::from_samples(1, vec![true, false]).into();
        assert_eq!(w.kind(), StreamKind::Digital);
        assert!(w.is_uniform());
        assert!(w.as_uniform_analog().is_none());
        assert!(w.analog_samples().is_none());
        assert_eq!(w.len(), 2);
        assert_eq!(w.type_name(), "uniform digital");
    }

    #[test]
    fn copy_timebase() {
        let mut src = WaveformHeader::with_timescale(40);
        src.trigger_phase = 3;
        src.start_timestamp = 1_700_000_000;
        let mut dst = WaveformHeader::default();
        dst.copy_timebase_from(&src);
        assert_eq!(dst.timescale, 40);
        assert_eq!(dst.trigger_phase, 3);
        assert_eq!(dst.start_timestamp, 1_700_000_000);
        assert_eq!(dst.revision(), 0);
    }
}
