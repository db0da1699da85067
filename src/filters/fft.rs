//! Magnitude spectrum of a uniform analog waveform.
//!
//! The input is windowed, zero padded to a power of two and transformed with
//! an in-place radix-2 FFT. The output is a uniform waveform whose x axis is
//! frequency: `timescale` holds the bin spacing in Hz and each sample is the
//! peak amplitude in volts of that bin.

use crate::error::FilterError;
use crate::filter::{
    Filter, InputSet, InputSpec, OutputSet, OutputSpec, ParameterSet, ParameterValue,
    RefreshContext,
};
use crate::waveform::FS_PER_SECOND;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    Rectangular,
    Hann,
    Hamming,
    BlackmanHarris,
}

impl WindowFunction {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "rectangular" | "none" => Some(Self::Rectangular),
            "hann" | "hanning" => Some(Self::Hann),
            "hamming" => Some(Self::Hamming),
            "blackmanharris" => Some(Self::BlackmanHarris),
            _ => None,
        }
    }

    fn coefficient(&self, i: usize, n: usize) -> f64 {
        if n < 2 {
            return 1.0;
        }
        let x = 2.0 * PI * i as f64 / (n - 1) as f64;
        match self {
            Self::Rectangular => 1.0,
            Self::Hann => 0.5 - 0.5 * x.cos(),
            Self::Hamming => 0.54 - 0.46 * x.cos(),
            Self::BlackmanHarris => {
                0.35875 - 0.48829 * x.cos() + 0.14128 * (2.0 * x).cos() - 0.01168 * (3.0 * x).cos()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fft {
    params: ParameterSet,
}

impl Fft {
    pub fn new() -> Self {
        Self {
            params: ParameterSet::new().declare(
                "window",
                ParameterValue::Text("rectangular".to_string()),
                "",
            ),
        }
    }
}

impl Default for Fft {
    fn default() -> Self {
        Self::new()
    }
}

/// In-place iterative radix-2 transform. `re.len()` must be a power of two.
fn fft_in_place(re: &mut [f64], im: &mut [f64]) {
    let n = re.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            re.swap(i, j);
            im.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * PI / len as f64;
        for start in (0..n).step_by(len) {
            for k in 0..len / 2 {
                let (s, c) = (angle * k as f64).sin_cos();
                let (a, b) = (start + k, start + k + len / 2);
                let tr = re[b] * c - im[b] * s;
                let ti = re[b] * s + im[b] * c;
                re[b] = re[a] - tr;
                im[b] = im[a] - ti;
                re[a] += tr;
                im[a] += ti;
            }
        }
        len <<= 1;
    }
}

impl Filter for Fft {
    fn kind(&self) -> &'static str {
        "fft"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::analog("in")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::analog("magnitude")]
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn refresh(
        &mut self,
        inputs: &InputSet<'_>,
        outputs: &mut OutputSet,
        _ctx: &mut RefreshContext<'_>,
    ) -> Result<(), FilterError> {
        let input = inputs.uniform_analog("in")?;
        if input.is_empty() {
            return Err(FilterError::NoData("in".to_string()));
        }
        if input.header.timescale <= 0 {
            return Err(FilterError::Unsupported(
                "FFT input has no sample period".to_string(),
            ));
        }
        let window_name = self.params.text("window")?;
        let window = WindowFunction::parse(window_name).ok_or_else(|| FilterError::BadParameter {
            name: "window".to_string(),
            reason: format!("unknown window '{}'", window_name),
        })?;

        let len = input.len();
        let n = len.next_power_of_two();
        let mut re = vec![0.0f64; n];
        let mut im = vec![0.0f64; n];
        let mut gain = 0.0;
        for (i, &x) in input.samples.iter().enumerate() {
            let w = window.coefficient(i, len);
            re[i] = x as f64 * w;
            gain += w;
        }
        fft_in_place(&mut re, &mut im);

        let bins = n / 2 + 1;
        let sample_rate = FS_PER_SECOND as f64 / input.header.timescale as f64;
        let bin_hz = sample_rate / n as f64;

        let out = outputs.uniform_analog(0);
        out.header.timescale = bin_hz.round().max(1.0) as i64;
        out.header.trigger_phase = 0;
        out.header.clipped = input.header.clipped;
        out.header.start_timestamp = input.header.start_timestamp;
        out.header.start_femtoseconds = input.header.start_femtoseconds;
        out.resize(bins);
        out.samples.prepare_for_cpu_overwrite();
        for (k, o) in out.samples.as_mut_slice().iter_mut().enumerate() {
            let scale = if k == 0 || k == n / 2 { 1.0 } else { 2.0 };
            *o = (re[k].hypot(im[k]) * scale / gain) as f32;
        }
        out.mark_modified_from_cpu();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::testing::{analog, run};
    use crate::waveform::UniformAnalogWaveform;

    fn tone(n: usize, cycles: f64, amplitude: f32, dc: f32) -> (&'static str, crate::waveform::Waveform) {
        let values = (0..n)
            .map(|i| dc + amplitude * (2.0 * PI * cycles * i as f64 / n as f64).sin() as f32)
            .collect();
        // 1 ns per sample
        ("in", UniformAnalogWaveform::from_samples(1_000_000, values).into())
    }

    #[test]
    fn tone_lands_in_its_bin() {
        let (out, result, _) = run(&mut Fft::new(), &mut [tone(64, 4.0, 1.0, 0.25)], false);
        result.unwrap();
        let mag = analog(&out, 0);
        assert_eq!(mag.len(), 33);
        assert!((mag[4] - 1.0).abs() < 1e-4);
        assert!((mag[0] - 0.25).abs() < 1e-4);
        for (k, m) in mag.iter().enumerate() {
            if k != 0 && k != 4 {
                assert!(*m < 1e-4, "bin {} = {}", k, m);
            }
        }
        // 1 GS/s over 64 points
        assert_eq!(out.get(0).unwrap().header().timescale, 15_625_000);
    }

    #[test]
    fn window_keeps_peak_amplitude() {
        let mut fft = Fft::new();
        fft.parameters_mut().parse_and_set("window", "Blackman-Harris").unwrap();
        let (out, result, _) = run(&mut fft, &mut [tone(256, 32.0, 0.5, 0.0)], false);
        result.unwrap();
        let mag = analog(&out, 0);
        let (peak, value) = mag
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |best, (k, &m)| if m > best.1 { (k, m) } else { best });
        assert_eq!(peak, 32);
        assert!((value - 0.5).abs() < 0.01);
    }

    #[test]
    fn non_power_of_two_is_padded() {
        let (out, result, _) = run(&mut Fft::new(), &mut [tone(100, 3.0, 1.0, 0.0)], false);
        result.unwrap();
        assert_eq!(analog(&out, 0).len(), 65);
    }

    #[test]
    fn unknown_window_is_rejected() {
        let mut fft = Fft::new();
        fft.parameters_mut().parse_and_set("window", "kaiser").unwrap();
        let (_, result, _) = run(&mut fft, &mut [tone(8, 1.0, 1.0, 0.0)], false);
        assert!(matches!(result, Err(FilterError::BadParameter { .. })));
    }
}
