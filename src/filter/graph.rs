//! Arena of filter nodes with explicit reference counts.
//!
//! A [`FilterId`] stays valid until the node's count drops to zero. Binding an
//! input to another node's output holds a reference on that node, so a filter
//! cannot be destroyed while something downstream still reads from it.

use super::{Filter, InputSpec, OutputSet};
use crate::channel::ChannelTable;
use crate::error::GraphError;
use crate::stream::{FilterId, StreamDescriptor, StreamOwner, StreamVersion};
use crate::waveform::{StreamKind, Waveform};
use log::debug;

/// Outcome of a node's most recent execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// Never run.
    Pending,
    Ok,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct InputSlot {
    pub spec: InputSpec,
    pub source: Option<StreamDescriptor>,
}

pub struct FilterNode {
    name: String,
    filter: Box<dyn Filter>,
    pub(super) inputs: Vec<InputSlot>,
    pub(super) outputs: OutputSet,
    gpu_enabled: bool,
    refcount: usize,
    pub(super) status: NodeStatus,
    pub(super) last_inputs: Option<Vec<Option<StreamVersion>>>,
    pub(super) last_params: u64,
    pub(super) run_count: u64,
}

impl FilterNode {
    fn new(name: String, filter: Box<dyn Filter>) -> Self {
        let inputs = filter
            .inputs()
            .into_iter()
            .map(|spec| InputSlot { spec, source: None })
            .collect();
        let outputs = OutputSet::new(filter.outputs());
        Self {
            name,
            filter,
            inputs,
            outputs,
            gpu_enabled: true,
            refcount: 1,
            status: NodeStatus::Pending,
            last_inputs: None,
            last_params: 0,
            run_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &dyn Filter {
        self.filter.as_ref()
    }

    pub fn filter_mut(&mut self) -> &mut dyn Filter {
        self.filter.as_mut()
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &OutputSet {
        &self.outputs
    }

    /// Whether the GPU path may be used, if the filter has one.
    pub fn gpu_enabled(&self) -> bool {
        self.gpu_enabled
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn status(&self) -> &NodeStatus {
        &self.status
    }

    /// Number of completed refresh calls, successful or not.
    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    pub(super) fn filter_and_outputs(&mut self) -> (&mut dyn Filter, &mut OutputSet) {
        (self.filter.as_mut(), &mut self.outputs)
    }

    /// Filters this node reads from.
    pub fn upstream(&self) -> impl Iterator<Item = FilterId> + '_ {
        self.inputs
            .iter()
            .filter_map(|slot| slot.source.and_then(|s| s.source_filter()))
    }
}

impl std::fmt::Debug for FilterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterNode")
            .field("name", &self.name)
            .field("kind", &self.filter.kind())
            .field("refcount", &self.refcount)
            .field("status", &self.status)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct FilterGraph {
    nodes: Vec<Option<FilterNode>>,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. The caller holds the initial reference.
    pub fn create(&mut self, name: impl Into<String>, filter: Box<dyn Filter>) -> FilterId {
        let id = FilterId(self.nodes.len());
        let node = FilterNode::new(name.into(), filter);
        debug!("Created filter '{}' ({}) as {:?}", node.name, node.filter.kind(), id);
        self.nodes.push(Some(node));
        id
    }

    pub fn retain(&mut self, id: FilterId) -> Result<(), GraphError> {
        self.node_mut(id).ok_or(GraphError::InvalidFilter(id))?.refcount += 1;
        Ok(())
    }

    /// Drop one reference. Returns `true` if the node was destroyed, in which
    /// case the references it held on its sources are released too.
    pub fn release(&mut self, id: FilterId) -> Result<bool, GraphError> {
        let node = self.node_mut(id).ok_or(GraphError::InvalidFilter(id))?;
        node.refcount -= 1;
        if node.refcount > 0 {
            return Ok(false);
        }

        let mut doomed = vec![id];
        while let Some(id) = doomed.pop() {
            let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else {
                continue;
            };
            debug!("Destroyed filter '{}'", node.name);
            for source in node.upstream() {
                if let Some(upstream) = self.node_mut(source) {
                    upstream.refcount -= 1;
                    if upstream.refcount == 0 {
                        doomed.push(source);
                    }
                }
            }
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live node ids in creation order.
    pub fn ids(&self) -> Vec<FilterId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| FilterId(i))
            .collect()
    }

    pub fn node(&self, id: FilterId) -> Option<&FilterNode> {
        self.nodes.get(id.0)?.as_ref()
    }

    pub fn node_mut(&mut self, id: FilterId) -> Option<&mut FilterNode> {
        self.nodes.get_mut(id.0)?.as_mut()
    }

    pub fn find(&self, name: &str) -> Option<FilterId> {
        self.nodes
            .iter()
            .position(|n| n.as_ref().is_some_and(|n| n.name == name))
            .map(FilterId)
    }

    pub fn set_gpu_enabled(&mut self, id: FilterId, enabled: bool) -> Result<(), GraphError> {
        self.node_mut(id).ok_or(GraphError::InvalidFilter(id))?.gpu_enabled = enabled;
        Ok(())
    }

    /// Bind input `index` of `id` to `source`, replacing any earlier binding.
    ///
    /// The source must exist and carry the kind of data the input accepts.
    /// Cycles are not rejected here; the executor reports them.
    pub fn set_input(
        &mut self,
        id: FilterId,
        index: usize,
        source: StreamDescriptor,
        channels: &ChannelTable,
    ) -> Result<(), GraphError> {
        let node = self.node(id).ok_or(GraphError::InvalidFilter(id))?;
        let slot = node.inputs.get(index).ok_or_else(|| GraphError::NoSuchInput {
            filter: node.name.clone(),
            input: index.to_string(),
        })?;
        let kind = self.stream_kind(source, channels)?;
        if kind != slot.spec.kind {
            return Err(GraphError::KindMismatch {
                filter: node.name.clone(),
                input: slot.spec.name.to_string(),
                kind: kind.name(),
            });
        }

        if let Some(upstream) = source.source_filter() {
            self.retain(upstream)?;
        }
        let previous = self.bind(id, index, Some(source));
        self.release_binding(previous)
    }

    pub fn set_input_by_name(
        &mut self,
        id: FilterId,
        input: &str,
        source: StreamDescriptor,
        channels: &ChannelTable,
    ) -> Result<(), GraphError> {
        let index = self.input_index(id, input)?;
        self.set_input(id, index, source, channels)
    }

    /// Unbind input `index`, releasing the reference it held.
    pub fn clear_input(&mut self, id: FilterId, index: usize) -> Result<(), GraphError> {
        let node = self.node(id).ok_or(GraphError::InvalidFilter(id))?;
        if index >= node.inputs.len() {
            return Err(GraphError::NoSuchInput {
                filter: node.name.clone(),
                input: index.to_string(),
            });
        }
        let previous = self.bind(id, index, None);
        self.release_binding(previous)
    }

    pub fn input_index(&self, id: FilterId, input: &str) -> Result<usize, GraphError> {
        let node = self.node(id).ok_or(GraphError::InvalidFilter(id))?;
        node.inputs
            .iter()
            .position(|s| s.spec.name == input)
            .ok_or_else(|| GraphError::NoSuchInput {
                filter: node.name.clone(),
                input: input.to_string(),
            })
    }

    /// Latest output of a filter stream.
    pub fn data(&self, source: StreamDescriptor) -> Option<&Waveform> {
        match source.owner {
            StreamOwner::Filter(id) => self.node(id)?.outputs.get(source.stream),
            StreamOwner::Channel(_) => None,
        }
    }

    pub(super) fn data_mut(&mut self, source: StreamDescriptor) -> Option<&mut Waveform> {
        match source.owner {
            StreamOwner::Filter(id) => self.node_mut(id)?.outputs.get_mut(source.stream),
            StreamOwner::Channel(_) => None,
        }
    }

    pub fn output_version(&self, source: StreamDescriptor) -> Option<StreamVersion> {
        match source.owner {
            StreamOwner::Filter(id) => self.node(id)?.outputs.version(source.stream),
            StreamOwner::Channel(_) => None,
        }
    }

    pub(super) fn take(&mut self, id: FilterId) -> Option<FilterNode> {
        self.nodes.get_mut(id.0)?.take()
    }

    pub(super) fn put_back(&mut self, id: FilterId, node: FilterNode) {
        self.nodes[id.0] = Some(node);
    }

    fn stream_kind(
        &self,
        source: StreamDescriptor,
        channels: &ChannelTable,
    ) -> Result<StreamKind, GraphError> {
        let kind = match source.owner {
            StreamOwner::Channel(ch) => channels.slot(ch, source.stream).map(|s| s.kind),
            StreamOwner::Filter(id) => self
                .node(id)
                .and_then(|n| n.outputs.spec(source.stream))
                .map(|s| s.kind),
        };
        kind.ok_or(GraphError::InvalidStream(source))
    }

    fn bind(
        &mut self,
        id: FilterId,
        index: usize,
        source: Option<StreamDescriptor>,
    ) -> Option<StreamDescriptor> {
        let node = self.node_mut(id)?;
        let previous = std::mem::replace(&mut node.inputs[index].source, source);
        // Force a rerun on the next cycle even if the new source has the same version.
        node.last_inputs = None;
        previous
    }

    fn release_binding(&mut self, previous: Option<StreamDescriptor>) -> Result<(), GraphError> {
        if let Some(upstream) = previous.and_then(|s| s.source_filter()) {
            self.release(upstream)?;
        }
        Ok(())
    }
}
