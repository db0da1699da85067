use crate::error::FilterError;
use crate::filter::{
    Filter, InputSet, InputSpec, Measurement, OutputSet, OutputSpec, ParameterSet, RefreshContext,
};
use crate::waveform::FS_PER_SECOND;

/// Cycle-by-cycle frequency from rising crossings of the signal midpoint.
///
/// Each output sample covers one period: it starts at a rising edge, lasts
/// until the next one and holds `1 / period` in Hz. Output offsets are in
/// femtoseconds (timescale 1).
#[derive(Debug, Clone, Default)]
pub struct Frequency {
    params: ParameterSet,
    average: Option<f64>,
}

impl Frequency {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Interpolated times, in femtoseconds, where `samples` rises through `level`.
fn rising_edges(samples: &[f32], level: f32, timescale: i64, phase: i64) -> Vec<f64> {
    samples
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] < level && w[1] >= level)
        .map(|(i, w)| {
            let frac = (level - w[0]) as f64 / (w[1] - w[0]) as f64;
            (i as f64 + frac) * timescale as f64 + phase as f64
        })
        .collect()
}

impl Measurement for Frequency {
    fn value(&self) -> Option<f64> {
        self.average
    }

    fn unit(&self) -> &'static str {
        "Hz"
    }
}

impl Filter for Frequency {
    fn kind(&self) -> &'static str {
        "frequency"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::analog("in")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::analog("frequency")]
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn as_measurement(&self) -> Option<&dyn Measurement> {
        Some(self)
    }

    fn refresh(
        &mut self,
        inputs: &InputSet<'_>,
        outputs: &mut OutputSet,
        _ctx: &mut RefreshContext<'_>,
    ) -> Result<(), FilterError> {
        self.average = None;
        let input = inputs.uniform_analog("in")?;
        let samples = input.samples.as_slice();
        let (lo, hi) = samples
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let edges = if lo < hi {
            let level = lo + (hi - lo) / 2.0;
            rising_edges(samples, level, input.header.timescale, input.header.trigger_phase)
        } else {
            Vec::new()
        };

        let out = outputs.sparse_analog(0);
        out.header.copy_timebase_from(&input.header);
        out.header.timescale = 1;
        out.header.trigger_phase = 0;
        out.clear();
        let rounded: Vec<i64> = edges.iter().map(|t| t.round() as i64).collect();
        let mut total = 0.0;
        for i in 1..edges.len() {
            let period = edges[i] - edges[i - 1];
            let hz = FS_PER_SECOND as f64 / period;
            total += hz;
            out.push(rounded[i - 1], rounded[i] - rounded[i - 1], hz as f32)?;
        }
        out.mark_modified_from_cpu();

        if edges.len() > 1 {
            self.average = Some(total / (edges.len() - 1) as f64);
        }
        Ok(())
    }
}
