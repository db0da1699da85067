//! Filter node interface and the data passed in and out of a refresh.

pub mod executor;
pub mod graph;
pub mod parameter;

pub use executor::{ExecutionReport, FilterGraphExecutor};
pub use graph::{FilterGraph, FilterNode, InputSlot, NodeStatus};
pub use parameter::{Parameter, ParameterSet, ParameterValue};

use crate::error::FilterError;
use crate::stream::StreamVersion;
use crate::waveform::{
    SparseAnalogWaveform, StreamKind, UniformAnalogWaveform, UniformDigitalWaveform, Waveform,
};
use log::trace;

/// Hardware features the executor may use, passed explicitly into every refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Run filters with a GPU path on the device side.
    pub gpu_filters: bool,
    /// Wide vector units are available for CPU paths.
    pub simd: bool,
}

impl Capabilities {
    pub fn detect() -> Self {
        Self {
            gpu_filters: true,
            simd: detect_simd(),
        }
    }

    pub fn cpu_only() -> Self {
        Self {
            gpu_filters: false,
            simd: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(target_arch = "x86_64")]
pub fn detect_simd() -> bool {
    std::is_x86_feature_detected!("avx2")
}

#[cfg(target_arch = "aarch64")]
pub fn detect_simd() -> bool {
    true
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn detect_simd() -> bool {
    false
}

/// Records kernel submissions made by GPU filter paths.
#[derive(Debug, Default)]
pub struct ComputeQueue {
    dispatches: u64,
    invocations: u64,
    last_kernel: Option<&'static str>,
}

impl ComputeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&mut self, kernel: &'static str, invocations: usize) {
        trace!("dispatch {} x{}", kernel, invocations);
        self.dispatches += 1;
        self.invocations += invocations as u64;
        self.last_kernel = Some(kernel);
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn last_kernel(&self) -> Option<&'static str> {
        self.last_kernel
    }
}

/// Per-session state the executor hands to filters.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    pub caps: Capabilities,
    pub queue: ComputeQueue,
}

impl ExecutionContext {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            queue: ComputeQueue::new(),
        }
    }
}

/// What one refresh call may use.
pub struct RefreshContext<'a> {
    /// Inputs were prepared for device access and the GPU path should run.
    pub use_gpu: bool,
    pub caps: Capabilities,
    pub queue: &'a mut ComputeQueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub name: &'static str,
    pub kind: StreamKind,
}

impl InputSpec {
    pub fn analog(name: &'static str) -> Self {
        Self {
            name,
            kind: StreamKind::Analog,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: &'static str,
    pub kind: StreamKind,
}

impl OutputSpec {
    pub fn analog(name: &'static str) -> Self {
        Self {
            name,
            kind: StreamKind::Analog,
        }
    }

    pub fn digital(name: &'static str) -> Self {
        Self {
            name,
            kind: StreamKind::Digital,
        }
    }
}

/// Optional capability for filters that reduce their input to one number.
pub trait Measurement {
    fn value(&self) -> Option<f64>;

    fn unit(&self) -> &'static str;
}

/// A node in the filter graph.
///
/// The executor calls [`refresh`](Filter::refresh) at most once per cycle, after
/// every source it reads from has been refreshed. Filters never schedule
/// themselves.
pub trait Filter: Send {
    /// Registry name, e.g. `"subtract"`.
    fn kind(&self) -> &'static str;

    fn inputs(&self) -> Vec<InputSpec>;

    fn outputs(&self) -> Vec<OutputSpec>;

    fn parameters(&self) -> &ParameterSet;

    fn parameters_mut(&mut self) -> &mut ParameterSet;

    fn has_gpu_path(&self) -> bool {
        false
    }

    fn as_measurement(&self) -> Option<&dyn Measurement> {
        None
    }

    fn refresh(
        &mut self,
        inputs: &InputSet<'_>,
        outputs: &mut OutputSet,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<(), FilterError>;
}

/// Waveforms bound to a node's inputs for one refresh, in declaration order.
#[derive(Debug, Default)]
pub struct InputSet<'a> {
    inputs: Vec<(&'static str, Option<&'a Waveform>)>,
}

impl<'a> InputSet<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, waveform: Option<&'a Waveform>) {
        self.inputs.push((name, waveform));
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&'a Waveform> {
        self.inputs
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, w)| *w)
    }

    pub fn require(&self, name: &str) -> Result<&'a Waveform, FilterError> {
        match self.inputs.iter().find(|(n, _)| *n == name) {
            None => Err(FilterError::MissingInput(name.to_string())),
            Some((_, None)) => Err(FilterError::NoData(name.to_string())),
            Some((_, Some(w))) => Ok(*w),
        }
    }

    pub fn uniform_analog(&self, name: &str) -> Result<&'a UniformAnalogWaveform, FilterError> {
        self.require(name)?
            .as_uniform_analog()
            .ok_or_else(|| FilterError::WrongInputType {
                input: name.to_string(),
                expected: "uniform analog",
            })
    }
}

#[derive(Debug)]
struct OutputSlot {
    spec: OutputSpec,
    data: Option<Waveform>,
    generation: u64,
}

/// A node's output streams. Waveforms persist across refreshes so their
/// buffers (and device allocations) are reused.
#[derive(Debug)]
pub struct OutputSet {
    slots: Vec<OutputSlot>,
    next_generation: u64,
}

impl OutputSet {
    pub fn new(specs: Vec<OutputSpec>) -> Self {
        Self {
            slots: specs
                .into_iter()
                .map(|spec| OutputSlot {
                    spec,
                    data: None,
                    generation: 0,
                })
                .collect(),
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn spec(&self, index: usize) -> Option<&OutputSpec> {
        self.slots.get(index).map(|s| &s.spec)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.spec.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&Waveform> {
        self.slots.get(index)?.data.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Waveform> {
        self.slots.get_mut(index)?.data.as_mut()
    }

    pub fn version(&self, index: usize) -> Option<StreamVersion> {
        let slot = self.slots.get(index)?;
        slot.data.as_ref().map(|w| StreamVersion {
            generation: slot.generation,
            revision: w.revision(),
        })
    }

    /// Every output holds a waveform.
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.data.is_some())
    }

    /// Replace an output with a new waveform object.
    pub fn set(&mut self, index: usize, waveform: Waveform) {
        self.next_generation += 1;
        let slot = &mut self.slots[index];
        slot.generation = self.next_generation;
        slot.data = Some(waveform);
    }

    /// Drop every output, e.g. after a failed refresh.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.data = None;
        }
    }

    fn reset_unless(&mut self, index: usize, keep: fn(&Waveform) -> bool, fresh: fn() -> Waveform) {
        if !self.slots[index].data.as_ref().is_some_and(keep) {
            self.set(index, fresh());
        }
    }

    /// Output `index` as a uniform analog waveform, replacing whatever of a
    /// different type it held.
    pub fn uniform_analog(&mut self, index: usize) -> &mut UniformAnalogWaveform {
        self.reset_unless(
            index,
            |w| matches!(w, Waveform::UniformAnalog(_)),
            || UniformAnalogWaveform::new(0).into(),
        );
        match &mut self.slots[index].data {
            Some(Waveform::UniformAnalog(w)) => w,
            _ => unreachable!("output was just reset to uniform analog"),
        }
    }

    pub fn sparse_analog(&mut self, index: usize) -> &mut SparseAnalogWaveform {
        self.reset_unless(
            index,
            |w| matches!(w, Waveform::SparseAnalog(_)),
            || SparseAnalogWaveform::new(0).into(),
        );
        match &mut self.slots[index].data {
            Some(Waveform::SparseAnalog(w)) => w,
            _ => unreachable!("output was just reset to sparse analog"),
        }
    }

    pub fn uniform_digital(&mut self, index: usize) -> &mut UniformDigitalWaveform {
        self.reset_unless(
            index,
            |w| matches!(w, Waveform::UniformDigital(_)),
            || UniformDigitalWaveform::new(0).into(),
        );
        match &mut self.slots[index].data {
            Some(Waveform::UniformDigital(w)) => w,
            _ => unreachable!("output was just reset to uniform digital"),
        }
    }
}
