use crate::error::FilterError;
use crate::filter::{
    Filter, InputSet, InputSpec, OutputSet, OutputSpec, ParameterSet, ParameterValue,
    RefreshContext,
};
use ndarray::{ArrayView1, ArrayViewMut1, Zip};

/// `A - B`, sample by sample, over the shorter of the two inputs.
#[derive(Debug, Clone, Default)]
pub struct Subtract {
    params: ParameterSet,
}

impl Subtract {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for Subtract {
    fn kind(&self) -> &'static str {
        "subtract"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::analog("A"), InputSpec::analog("B")]
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
        let a = inputs.uniform_analog("A")?;
        let b = inputs.uniform_analog("B")?;
        let len = a.len().min(b.len());

        let out = outputs.uniform_analog(0);
        out.header.copy_timebase_from(&a.header);
        out.header.clipped = a.header.clipped || b.header.clipped;
        out.resize(len);

        if ctx.use_gpu {
            out.samples.prepare_for_gpu_overwrite();
            let a = ArrayView1::from(&a.samples.device_slice()[..len]);
            let b = ArrayView1::from(&b.samples.device_slice()[..len]);
            Zip::from(ArrayViewMut1::from(out.samples.device_slice_mut()))
                .and(a)
                .and(b)
                .par_for_each(|o, &x, &y| *o = x - y);
            ctx.queue.dispatch("subtract", len);
            out.mark_modified_from_gpu();
        } else {
            out.samples.prepare_for_cpu_overwrite();
            let (a, b) = (&a.samples.as_slice()[..len], &b.samples.as_slice()[..len]);
            for ((o, x), y) in out.samples.as_mut_slice().iter_mut().zip(a).zip(b) {
                *o = x - y;
            }
            out.mark_modified_from_cpu();
        }
        Ok(())
    }
}

/// `in * gain + offset`.
#[derive(Debug, Clone)]
pub struct Scale {
    params: ParameterSet,
}

impl Scale {
    pub fn new() -> Self {
        Self {
            params: ParameterSet::new()
                .declare("gain", ParameterValue::Float(1.0), "V/V")
                .declare("offset", ParameterValue::Float(0.0), "V"),
        }
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Scale {
    fn kind(&self) -> &'static str {
        "scale"
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

    fn refresh(
        &mut self,
        inputs: &InputSet<'_>,
        outputs: &mut OutputSet,
        _ctx: &mut RefreshContext<'_>,
    ) -> Result<(), FilterError> {
        let input = inputs.uniform_analog("in")?;
        let gain = self.params.float("gain")? as f32;
        let offset = self.params.float("offset")? as f32;

        let out = outputs.uniform_analog(0);
        out.header.copy_timebase_from(&input.header);
        out.header.clipped = input.header.clipped;
        out.resize(input.len());
        out.samples.prepare_for_cpu_overwrite();
        for (o, &x) in out.samples.as_mut_slice().iter_mut().zip(input.samples.iter()) {
            *o = x * gain + offset;
        }
        out.mark_modified_from_cpu();
        Ok(())
    }
}
