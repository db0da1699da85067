//! Built-in filter nodes and the registry that creates them by name.

mod fft;
mod fir;
mod frequency;
mod math;
mod rms;
mod threshold;

pub use fft::{Fft, WindowFunction};
pub use fir::Fir;
pub use frequency::Frequency;
pub use math::{Scale, Subtract};
pub use rms::Rms;
pub use threshold::Threshold;

use crate::filter::Filter;
use std::collections::BTreeMap;

type Constructor = fn() -> Box<dyn Filter>;

/// Maps filter kind names to constructors.
#[derive(Debug, Clone, Default)]
pub struct FilterRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("subtract", || Box::new(Subtract::new()));
        registry.register("scale", || Box::new(Scale::new()));
        registry.register("fir", || Box::new(Fir::new()));
        registry.register("fft", || Box::new(Fft::new()));
        registry.register("rms", || Box::new(Rms::new()));
        registry.register("frequency", || Box::new(Frequency::new()));
        registry.register("threshold", || Box::new(Threshold::new()));
        registry
    }

    pub fn register(&mut self, kind: &'static str, constructor: Constructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Filter>> {
        self.constructors.get(kind).map(|make| make())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::filter::{Capabilities, ComputeQueue, Filter, InputSet, OutputSet, RefreshContext};
    use crate::waveform::Waveform;

    /// Run one refresh outside a graph, with every input prepared for the
    /// domain the filter will use.
    pub fn run(
        filter: &mut dyn Filter,
        inputs: &mut [(&'static str, Waveform)],
        use_gpu: bool,
    ) -> (OutputSet, Result<(), crate::error::FilterError>, ComputeQueue) {
        for (_, w) in inputs.iter_mut() {
            if use_gpu {
                w.prepare_for_gpu_access();
            } else {
                w.prepare_for_cpu_access();
            }
        }
        let mut set = InputSet::new();
        for (name, w) in inputs.iter() {
            set.push(*name, Some(w));
        }
        let mut outputs = OutputSet::new(filter.outputs());
        let mut queue = ComputeQueue::new();
        let result = {
            let mut ctx = RefreshContext {
                use_gpu,
                caps: Capabilities {
                    gpu_filters: use_gpu,
                    simd: false,
                },
                queue: &mut queue,
            };
            filter.refresh(&set, &mut outputs, &mut ctx)
        };
        (outputs, result, queue)
    }

    /// CPU copy of an analog output.
    pub fn analog(outputs: &OutputSet, index: usize) -> Vec<f32> {
        let mut w = outputs.get(index).expect("output missing").clone();
        w.prepare_for_cpu_access();
        w.analog_samples().expect("not analog").as_slice().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creates_builtin_kinds() {
        let registry = FilterRegistry::with_builtin();
        assert_eq!(
            registry.kinds().collect::<Vec<_>>(),
            vec!["fft", "fir", "frequency", "rms", "scale", "subtract", "threshold"]
        );
        for kind in registry.kinds() {
            assert_eq!(registry.create(kind).unwrap().kind(), kind);
        }
        assert!(registry.create("eye").is_none());
    }
}
