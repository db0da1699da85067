use crate::error::FilterError;
use crate::filter::{
    Filter, InputSet, InputSpec, Measurement, OutputSet, OutputSpec, ParameterSet, RefreshContext,
};

/// Root-mean-square of the whole input, as one sparse sample spanning it.
#[derive(Debug, Clone, Default)]
pub struct Rms {
    params: ParameterSet,
    last: Option<f64>,
}

impl Rms {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Measurement for Rms {
    fn value(&self) -> Option<f64> {
        self.last
    }

    fn unit(&self) -> &'static str {
        "V"
    }
}

impl Filter for Rms {
    fn kind(&self) -> &'static str {
        "rms"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::analog("in")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::analog("rms")]
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
        self.last = None;
        let input = inputs.require("in")?;
        let samples = input.analog_samples().ok_or_else(|| FilterError::WrongInputType {
            input: "in".to_string(),
            expected: "analog",
        })?;
        if samples.is_empty() {
            return Err(FilterError::NoData("in".to_string()));
        }

        let sum: f64 = samples.iter().map(|&v| v as f64 * v as f64).sum();
        let rms = (sum / samples.len() as f64).sqrt();

        // Span the input in units of its own timescale.
        let span = match input.as_sparse_analog() {
            Some(sparse) => {
                let last = sparse.len() - 1;
                sparse.offsets()[last] + sparse.durations()[last]
            }
            None => input.len() as i64,
        };

        let out = outputs.sparse_analog(0);
        out.header.copy_timebase_from(input.header());
        out.header.clipped = input.header().clipped;
        out.clear();
        out.push(0, span, rms as f32)?;
        out.mark_modified_from_cpu();
        self.last = Some(rms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::testing::run;
    use crate::waveform::{SparseAnalogWaveform, UniformAnalogWaveform, Waveform};

    #[test]
    fn square_wave_rms() {
        let values = vec![1.0, -1.0, 1.0, -1.0];
        let input: Waveform = UniformAnalogWaveform::from_samples(10, values).into();
        let mut rms = Rms::new();
        let (out, result, _) = run(&mut rms, &mut [("in", input)], false);
        result.unwrap();
        assert_eq!(rms.as_measurement().unwrap().value(), Some(1.0));

        let mut w = out.get(0).unwrap().clone();
        w.prepare_for_cpu_access();
        let w = w.as_sparse_analog().unwrap();
        assert_eq!(w.len(), 1);
        assert_eq!(w.durations()[0], 4);
        assert_eq!(w.samples()[0], 1.0);
    }

    #[test]
    fn sparse_input_span() {
        let mut sparse = SparseAnalogWaveform::new(1);
        sparse.push(10, 5, 3.0).unwrap();
        sparse.push(20, 5, 4.0).unwrap();
        sparse.mark_modified_from_cpu();
        let mut rms = Rms::new();
        let (out, result, _) = run(&mut rms, &mut [("in", sparse.into())], false);
        result.unwrap();
        let value = rms.value().unwrap();
        assert!((value - (12.5f64).sqrt()).abs() < 1e-9);
        let mut w = out.get(0).unwrap().clone();
        w.prepare_for_cpu_access();
        assert_eq!(w.as_sparse_analog().unwrap().durations()[0], 25);
    }

    #[test]
    fn empty_input_fails() {
        let input: Waveform = UniformAnalogWaveform::new(10).into();
        let mut rms = Rms::new();
        let (_, result, _) = run(&mut rms, &mut [("in", input)], false);
        assert!(matches!(result, Err(FilterError::NoData(_))));
        assert_eq!(rms.value(), None);
    }
}
