use crate::error::FilterError;
use crate::filter::{
    Filter, InputSet, InputSpec, OutputSet, OutputSpec, ParameterSet, ParameterValue,
    RefreshContext,
};

/// Analog to digital conversion with hysteresis.
///
/// The output goes high once the input rises above `threshold + hysteresis/2`
/// and low once it falls below `threshold - hysteresis/2`.
#[derive(Debug, Clone)]
pub struct Threshold {
    params: ParameterSet,
}

impl Threshold {
    pub fn new() -> Self {
        Self {
            params: ParameterSet::new()
                .declare("threshold", ParameterValue::Float(0.0), "V")
                .declare("hysteresis", ParameterValue::Float(0.0), "V"),
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Threshold {
    fn kind(&self) -> &'static str {
        "threshold"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::analog("in")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::digital("data")]
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
        let threshold = self.params.float("threshold")? as f32;
        let hysteresis = self.params.float("hysteresis")? as f32;
        if hysteresis < 0.0 {
            return Err(FilterError::BadParameter {
                name: "hysteresis".to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        let (rise, fall) = (threshold + hysteresis / 2.0, threshold - hysteresis / 2.0);

        let out = outputs.uniform_digital(0);
        out.header.copy_timebase_from(&input.header);
        out.resize(input.len());
        out.samples.prepare_for_cpu_overwrite();
        let mut state = input.samples.as_slice().first().is_some_and(|&v| v > threshold);
        for (o, &v) in out.samples.as_mut_slice().iter_mut().zip(input.samples.iter()) {
            if state && v < fall {
                state = false;
            } else if !state && v > rise {
                state = true;
            }
            *o = state;
        }
        out.mark_modified_from_cpu();
        Ok(())
    }
}
