//! Finite impulse response filter.
//!
//! Coefficients come from, in order of preference: a `taps_file` (numbers
//! separated by commas or whitespace, `#` starts a comment), the `taps`
//! list, or a Hamming-windowed sinc lowpass designed from `cutoff_hz` and
//! `length`. Output covers only the fully overlapped region, so it is
//! `taps - 1` samples shorter than the input.

use crate::error::FilterError;
use crate::filter::{
    Filter, InputSet, InputSpec, OutputSet, OutputSpec, ParameterSet, ParameterValue,
    RefreshContext,
};
use crate::waveform::FS_PER_SECOND;
use ndarray::{ArrayViewMut1, Zip};
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Fir {
    params: ParameterSet,
    /// Coefficients with the parameter revision and timescale they were built for.
    cached: Option<(u64, i64, Vec<f32>)>,
}

impl Fir {
    pub fn new() -> Self {
        Self {
            params: ParameterSet::new()
                .declare("taps", ParameterValue::FloatList(Vec::new()), "")
                .declare("taps_file", ParameterValue::Path(PathBuf::new()), "")
                .declare("cutoff_hz", ParameterValue::Float(0.0), "Hz")
                .declare("length", ParameterValue::Int(31), ""),
            cached: None,
        }
    }

    fn taps(&mut self, timescale: i64) -> Result<&[f32], FilterError> {
        let revision = self.params.revision();
        let fresh = matches!(&self.cached, Some((r, t, _)) if *r == revision && *t == timescale);
        if !fresh {
            let taps = self.build_taps(timescale)?;
            self.cached = Some((revision, timescale, taps));
        }
        Ok(self.cached.as_ref().map(|(_, _, t)| t.as_slice()).unwrap_or(&[]))
    }

    fn build_taps(&self, timescale: i64) -> Result<Vec<f32>, FilterError> {
        let file = self.params.path("taps_file")?;
        if !file.as_os_str().is_empty() {
            return read_taps(file);
        }
        let list = self.params.float_list("taps")?;
        if !list.is_empty() {
            return Ok(list.iter().map(|&t| t as f32).collect());
        }

        let cutoff = self.params.float("cutoff_hz")?;
        if cutoff <= 0.0 {
            return Err(FilterError::BadParameter {
                name: "taps".to_string(),
                reason: "no coefficients: set taps, taps_file or cutoff_hz".to_string(),
            });
        }
        if timescale <= 0 {
            return Err(FilterError::Unsupported(
                "cannot design a lowpass for a waveform without a timescale".to_string(),
            ));
        }
        let sample_rate = FS_PER_SECOND as f64 / timescale as f64;
        let fc = cutoff / sample_rate;
        if fc >= 0.5 {
            return Err(FilterError::BadParameter {
                name: "cutoff_hz".to_string(),
                reason: format!("{} Hz is above Nyquist ({} Hz)", cutoff, sample_rate / 2.0),
            });
        }
        let length = self.params.int("length")?;
        if length < 1 {
            return Err(FilterError::BadParameter {
                name: "length".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(lowpass(fc, length as usize | 1))
    }
}

impl Default for Fir {
    fn default() -> Self {
        Self::new()
    }
}

/// Windowed-sinc lowpass with unity DC gain. `fc` is normalized to the sample rate.
fn lowpass(fc: f64, length: usize) -> Vec<f32> {
    let middle = (length - 1) as f64 / 2.0;
    let raw: Vec<f64> = (0..length)
        .map(|i| {
            let x = i as f64 - middle;
            let sinc = if x == 0.0 {
                2.0 * fc
            } else {
                (2.0 * PI * fc * x).sin() / (PI * x)
            };
            let window = if length > 1 {
                0.54 - 0.46 * (2.0 * PI * i as f64 / (length - 1) as f64).cos()
            } else {
                1.0
            };
            sinc * window
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.iter().map(|&h| (h / sum) as f32).collect()
}

fn read_taps(path: &Path) -> Result<Vec<f32>, FilterError> {
    let text = std::fs::read_to_string(path).map_err(|source| FilterError::File {
        path: path.display().to_string(),
        source,
    })?;
    let taps = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>().map_err(|e| FilterError::BadParameter {
                name: "taps_file".to_string(),
                reason: format!("{}: '{}': {}", path.display(), s, e),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if taps.is_empty() {
        return Err(FilterError::BadParameter {
            name: "taps_file".to_string(),
            reason: format!("{} holds no coefficients", path.display()),
        });
    }
    Ok(taps)
}

fn dot(taps: &[f32], window: &[f32]) -> f32 {
    // window is in input order, taps apply reversed
    taps.iter().zip(window.iter().rev()).map(|(t, x)| t * x).sum()
}

/// Same result as [`dot`] with four independent accumulators, which lets the
/// compiler keep the loop in vector registers.
fn dot_wide(taps: &[f32], window: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    let n = taps.len();
    let chunks = n / 4;
    for c in 0..chunks {
        for lane in 0..4 {
            let k = c * 4 + lane;
            acc[lane] += taps[k] * window[n - 1 - k];
        }
    }
    let mut sum = acc.iter().sum::<f32>();
    for k in chunks * 4..n {
        sum += taps[k] * window[n - 1 - k];
    }
    sum
}

impl Filter for Fir {
    fn kind(&self) -> &'static str {
        "fir"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::analog("in")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::analog("data")]
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn has_gpu_path(&self) -> bool {
        true
    }

    fn refresh(
        &mut self,
        inputs: &InputSet<'_>,
        outputs: &mut OutputSet,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<(), FilterError> {
        let input = inputs.uniform_analog("in")?;
        let timescale = input.header.timescale;
        let taps = self.taps(timescale)?;
        let ntaps = taps.len();
        let len = (input.len() + 1).saturating_sub(ntaps);

        let out = outputs.uniform_analog(0);
        out.header.copy_timebase_from(&input.header);
        out.header.trigger_phase += (ntaps as i64 - 1) * timescale / 2;
        out.header.clipped = input.header.clipped;
        out.resize(len);

        if ctx.use_gpu {
            out.samples.prepare_for_gpu_overwrite();
            let x = input.samples.device_slice();
            Zip::indexed(ArrayViewMut1::from(out.samples.device_slice_mut()))
                .par_for_each(|j, o| *o = dot(taps, &x[j..j + ntaps]));
            ctx.queue.dispatch("fir", len);
            out.mark_modified_from_gpu();
        } else {
            out.samples.prepare_for_cpu_overwrite();
            let x = input.samples.as_slice();
            let kernel = if ctx.caps.simd { dot_wide } else { dot };
            for (j, o) in out.samples.as_mut_slice().iter_mut().enumerate() {
                *o = kernel(taps, &x[j..j + ntaps]);
            }
            out.mark_modified_from_cpu();
        }
        Ok(())
    }
}
