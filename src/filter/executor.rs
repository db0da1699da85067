//! Runs every live filter once per acquisition cycle in dependency order.

use super::graph::{FilterGraph, FilterNode, NodeStatus};
use super::{ExecutionContext, InputSet, RefreshContext};
use crate::channel::ChannelTable;
use crate::error::{FilterError, GraphError};
use crate::stream::{FilterId, StreamDescriptor, StreamOwner, StreamVersion};
use crate::waveform::Waveform;
use log::{debug, error, warn};
use std::collections::{BTreeSet, HashMap};

/// What happened during one [`FilterGraphExecutor::run_blocking`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    /// Every live node in the order it was visited.
    pub order: Vec<FilterId>,
    /// Nodes whose refresh ran and succeeded.
    pub ran: Vec<FilterId>,
    /// Nodes left alone because nothing they depend on changed.
    pub skipped: Vec<FilterId>,
    /// Nodes that failed, or were not run because an upstream node failed.
    pub failed: Vec<(FilterId, String)>,
}

impl ExecutionReport {
    pub fn is_failed(&self, id: FilterId) -> bool {
        self.failed.iter().any(|(f, _)| *f == id)
    }
}

#[derive(Debug, Default)]
pub struct FilterGraphExecutor {
    /// Refresh every node on every cycle instead of skipping unchanged ones.
    pub always_recompute: bool,
}

impl FilterGraphExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_recompute() -> Self {
        Self {
            always_recompute: true,
        }
    }

    /// Refresh every live node once, sources before consumers, and return
    /// when all of them are done.
    ///
    /// A failing node has its outputs cleared and every node downstream of it
    /// is marked failed without running. Independent branches still run.
    /// A cycle is reported before anything runs.
    pub fn run_blocking(
        &mut self,
        graph: &mut FilterGraph,
        channels: &mut ChannelTable,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionReport, GraphError> {
        let order = match topological_order(graph) {
            Ok(order) => order,
            Err(e) => {
                error!("{}", e);
                return Err(e);
            }
        };

        let mut report = ExecutionReport {
            order: order.clone(),
            ..Default::default()
        };
        for id in order {
            let Some(mut node) = graph.take(id) else {
                continue;
            };
            match self.run_node(&mut node, graph, channels, ctx) {
                Outcome::Ran => report.ran.push(id),
                Outcome::Skipped => report.skipped.push(id),
                Outcome::Failed(reason) => report.failed.push((id, reason)),
            }
            graph.put_back(id, node);
        }
        Ok(report)
    }

    fn run_node(
        &self,
        node: &mut FilterNode,
        graph: &mut FilterGraph,
        channels: &mut ChannelTable,
        ctx: &mut ExecutionContext,
    ) -> Outcome {
        if let Some(upstream) = failed_upstream(node, graph) {
            let reason = FilterError::UpstreamFailed(upstream).to_string();
            debug!("Skipping '{}': {}", node.name(), reason);
            node.outputs.clear();
            node.status = NodeStatus::Failed(reason.clone());
            node.last_inputs = None;
            return Outcome::Failed(reason);
        }

        let versions: Vec<Option<StreamVersion>> = node
            .inputs
            .iter()
            .map(|slot| slot.source.and_then(|s| source_version(s, graph, channels)))
            .collect();
        let params = node.filter().parameters().revision();
        if !self.always_recompute
            && node.status == NodeStatus::Ok
            && node.outputs.is_complete()
            && node.last_params == params
            && node.last_inputs.as_ref() == Some(&versions)
        {
            return Outcome::Skipped;
        }

        let use_gpu = ctx.caps.gpu_filters && node.gpu_enabled() && node.filter().has_gpu_path();
        for source in node.inputs.iter().filter_map(|slot| slot.source) {
            if let Some(w) = source_data_mut(source, graph, channels) {
                if use_gpu {
                    w.prepare_for_gpu_access();
                } else {
                    w.prepare_for_cpu_access();
                }
            }
        }

        let result = {
            let mut inputs = InputSet::new();
            for slot in &node.inputs {
                let data = slot.source.and_then(|s| source_data(s, graph, channels));
                inputs.push(slot.spec.name, data);
            }
            let mut refresh_ctx = RefreshContext {
                use_gpu,
                caps: ctx.caps,
                queue: &mut ctx.queue,
            };
            refresh_node(node, &inputs, &mut refresh_ctx)
        };
        node.run_count += 1;

        match result {
            Ok(()) => {
                node.status = NodeStatus::Ok;
                node.last_inputs = Some(versions);
                node.last_params = params;
                Outcome::Ran
            }
            Err(e) => {
                let reason = e.to_string();
                let repeated = node.status == NodeStatus::Failed(reason.clone());
                if repeated {
                    debug!("Filter '{}' still failing: {}", node.name(), reason);
                } else {
                    warn!("Filter '{}' failed: {}", node.name(), reason);
                }
                node.outputs.clear();
                node.status = NodeStatus::Failed(reason.clone());
                node.last_inputs = None;
                Outcome::Failed(reason)
            }
        }
    }
}

enum Outcome {
    Ran,
    Skipped,
    Failed(String),
}

fn refresh_node(
    node: &mut FilterNode,
    inputs: &InputSet<'_>,
    ctx: &mut RefreshContext<'_>,
) -> Result<(), FilterError> {
    if let Some(slot) = node.inputs.iter().find(|s| s.source.is_none()) {
        return Err(FilterError::MissingInput(slot.spec.name.to_string()));
    }
    let (filter, outputs) = node.filter_and_outputs();
    filter.refresh(inputs, outputs, ctx)
}

fn failed_upstream(node: &FilterNode, graph: &FilterGraph) -> Option<String> {
    node.upstream().find_map(|id| {
        let upstream = graph.node(id)?;
        matches!(upstream.status(), NodeStatus::Failed(_)).then(|| upstream.name().to_string())
    })
}

fn source_version(
    source: StreamDescriptor,
    graph: &FilterGraph,
    channels: &ChannelTable,
) -> Option<StreamVersion> {
    match source.owner {
        StreamOwner::Channel(ch) => channels.version(ch, source.stream),
        StreamOwner::Filter(_) => graph.output_version(source),
    }
}

fn source_data<'a>(
    source: StreamDescriptor,
    graph: &'a FilterGraph,
    channels: &'a ChannelTable,
) -> Option<&'a Waveform> {
    match source.owner {
        StreamOwner::Channel(ch) => channels.waveform(ch, source.stream),
        StreamOwner::Filter(_) => graph.data(source),
    }
}

fn source_data_mut<'a>(
    source: StreamDescriptor,
    graph: &'a mut FilterGraph,
    channels: &'a mut ChannelTable,
) -> Option<&'a mut Waveform> {
    match source.owner {
        StreamOwner::Channel(ch) => channels.waveform_mut(ch, source.stream),
        StreamOwner::Filter(_) => graph.data_mut(source),
    }
}

/// Kahn's algorithm over the input bindings. Ties are broken by id so the
/// order is stable from run to run.
fn topological_order(graph: &FilterGraph) -> Result<Vec<FilterId>, GraphError> {
    let ids = graph.ids();
    let mut indegree: HashMap<FilterId, usize> = ids.iter().map(|&id| (id, 0)).collect();
    let mut consumers: HashMap<FilterId, Vec<FilterId>> = HashMap::new();
    for &id in &ids {
        let Some(node) = graph.node(id) else { continue };
        for upstream in node.upstream() {
            if indegree.contains_key(&upstream) {
                *indegree.entry(id).or_default() += 1;
                consumers.entry(upstream).or_default().push(id);
            }
        }
    }

    let mut ready: BTreeSet<FilterId> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &consumer in consumers.get(&id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(&consumer) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(consumer);
                }
            }
        }
    }

    if order.len() < ids.len() {
        let mut stuck: BTreeSet<FilterId> = ids.into_iter().filter(|id| !order.contains(id)).collect();
        prune_downstream(&mut stuck, &consumers);
        let names = stuck
            .into_iter()
            .filter_map(|id| graph.node(id).map(|n| n.name().to_string()))
            .collect();
        return Err(GraphError::Cycle(names));
    }
    Ok(order)
}

/// Drop nodes that only hang off a cycle: repeatedly remove anything with no
/// consumer left in the set.
fn prune_downstream(stuck: &mut BTreeSet<FilterId>, consumers: &HashMap<FilterId, Vec<FilterId>>) {
    loop {
        let sinks: Vec<FilterId> = stuck
            .iter()
            .copied()
            .filter(|id| {
                !consumers
                    .get(id)
                    .into_iter()
                    .flatten()
                    .any(|c| stuck.contains(c))
            })
            .collect();
        if sinks.is_empty() {
            return;
        }
        for id in sinks {
            stuck.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Capabilities;
    use crate::filters::{Scale, Subtract};
    use crate::instrument::InstrumentId;
    use crate::stream::ChannelId;
    use crate::waveform::{StreamKind, UniformAnalogWaveform};

    struct Fixture {
        graph: FilterGraph,
        channels: ChannelTable,
        ctx: ExecutionContext,
        ch: ChannelId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut channels = ChannelTable::new();
            let ch = channels.add_channel("scope:CH1", InstrumentId(0), 0, &[("data", StreamKind::Analog)]);
            channels.set_waveform(
                ch,
                0,
                UniformAnalogWaveform::from_samples(1_000, vec![1.0, 2.0, 3.0]).into(),
            );
            Self {
                graph: FilterGraph::new(),
                channels,
                ctx: ExecutionContext::new(Capabilities::cpu_only()),
                ch,
            }
        }

        fn chain(&mut self) -> (FilterId, FilterId, FilterId) {
            let a = self.graph.create("a", Box::new(Scale::new()));
            let b = self.graph.create("b", Box::new(Scale::new()));
            let c = self.graph.create("c", Box::new(Scale::new()));
            let ch = StreamDescriptor::channel(self.ch, 0);
            // Bind in reverse so creation order differs from dependency order.
            self.graph
                .set_input(c, 0, StreamDescriptor::filter(b, 0), &self.channels)
                .unwrap();
            self.graph
                .set_input(b, 0, StreamDescriptor::filter(a, 0), &self.channels)
                .unwrap();
            self.graph.set_input(a, 0, ch, &self.channels).unwrap();
            (a, b, c)
        }

        fn run(&mut self, exec: &mut FilterGraphExecutor) -> ExecutionReport {
            exec.run_blocking(&mut self.graph, &mut self.channels, &mut self.ctx)
                .unwrap()
        }

        fn revision(&self, id: FilterId) -> u64 {
            self.graph.output_version(StreamDescriptor::filter(id, 0)).unwrap().revision
        }
    }

    #[test]
    fn dependency_order() {
        let mut f = Fixture::new();
        let a = f.graph.create("late-source", Box::new(Scale::new()));
        let b = f.graph.create("consumer", Box::new(Scale::new()));
        // Make the older node depend on the newer one.
        f.graph
            .set_input(a, 0, StreamDescriptor::filter(b, 0), &f.channels)
            .unwrap();
        f.graph
            .set_input(b, 0, StreamDescriptor::channel(f.ch, 0), &f.channels)
            .unwrap();
        let report = f.run(&mut FilterGraphExecutor::new());
        assert_eq!(report.order, vec![b, a]);
        assert_eq!(report.ran, vec![b, a]);
    }

    #[test]
    fn unchanged_nodes_are_skipped() {
        let mut f = Fixture::new();
        let (a, b, c) = f.chain();
        let mut exec = FilterGraphExecutor::new();

        let first = f.run(&mut exec);
        assert_eq!(first.ran, vec![a, b, c]);
        let revs = (f.revision(a), f.revision(b), f.revision(c));

        let second = f.run(&mut exec);
        assert_eq!(second.skipped, vec![a, b, c]);
        assert_eq!((f.revision(a), f.revision(b), f.revision(c)), revs);

        // A parameter change on `a` reruns the whole chain.
        f.graph
            .node_mut(a)
            .unwrap()
            .filter_mut()
            .parameters_mut()
            .set("gain", crate::filter::ParameterValue::Float(2.0))
            .unwrap();
        let third = f.run(&mut exec);
        assert_eq!(third.ran, vec![a, b, c]);
        assert_eq!(f.revision(a), revs.0 + 1);
        assert_eq!(f.revision(c), revs.2 + 1);
    }

    #[test]
    fn parameter_change_downstream_leaves_upstream_alone() {
        let mut f = Fixture::new();
        let (a, b, c) = f.chain();
        let mut exec = FilterGraphExecutor::new();
        f.run(&mut exec);

        f.graph
            .node_mut(b)
            .unwrap()
            .filter_mut()
            .parameters_mut()
            .set("offset", crate::filter::ParameterValue::Float(1.0))
            .unwrap();
        let report = f.run(&mut exec);
        assert_eq!(report.skipped, vec![a]);
        assert_eq!(report.ran, vec![b, c]);
    }

    #[test]
    fn new_capture_reruns_everything() {
        let mut f = Fixture::new();
        let (a, b, c) = f.chain();
        let mut exec = FilterGraphExecutor::new();
        f.run(&mut exec);
        f.channels.set_waveform(
            f.ch,
            0,
            UniformAnalogWaveform::from_samples(1_000, vec![1.0, 2.0, 3.0]).into(),
        );
        assert_eq!(f.run(&mut exec).ran, vec![a, b, c]);
    }

    #[test]
    fn always_recompute_gives_identical_output() {
        let mut f = Fixture::new();
        let (_, _, c) = f.chain();
        let mut exec = FilterGraphExecutor::always_recompute();
        f.run(&mut exec);
        let first = f.graph.data(StreamDescriptor::filter(c, 0)).unwrap().clone();
        let report = f.run(&mut exec);
        assert_eq!(report.ran.len(), 3);
        let mut second = f.graph.data(StreamDescriptor::filter(c, 0)).unwrap().clone();
        let mut first = first;
        first.prepare_for_cpu_access();
        second.prepare_for_cpu_access();
        assert_eq!(
            first.analog_samples().unwrap().as_slice(),
            second.analog_samples().unwrap().as_slice()
        );
    }

    #[test]
    fn failure_propagates_to_dependents_only() {
        let mut f = Fixture::new();
        let (a, b, c) = f.chain();
        // Independent branch reading the channel directly.
        let side = f.graph.create("side", Box::new(Scale::new()));
        f.graph
            .set_input(side, 0, StreamDescriptor::channel(f.ch, 0), &f.channels)
            .unwrap();
        // An unbound Subtract fails with a configuration error.
        let broken = f.graph.create("broken", Box::new(Subtract::new()));
        f.graph
            .set_input(broken, 0, StreamDescriptor::filter(a, 0), &f.channels)
            .unwrap();
        let downstream = f.graph.create("downstream", Box::new(Scale::new()));
        f.graph
            .set_input(downstream, 0, StreamDescriptor::filter(broken, 0), &f.channels)
            .unwrap();

        let report = f.run(&mut FilterGraphExecutor::new());
        assert!(report.is_failed(broken));
        assert!(report.is_failed(downstream));
        assert!(report.failed[0].1.contains("not connected"));
        assert!(report.failed[1].1.contains("broken"));
        for id in [a, b, c, side] {
            assert!(report.ran.contains(&id));
        }
        assert!(f.graph.data(StreamDescriptor::filter(broken, 0)).is_none());
        assert_eq!(f.graph.node(downstream).unwrap().run_count(), 0);
    }

    #[test]
    fn cycle_is_reported() {
        let mut f = Fixture::new();
        let a = f.graph.create("a", Box::new(Scale::new()));
        let b = f.graph.create("b", Box::new(Scale::new()));
        let ok = f.graph.create("ok", Box::new(Scale::new()));
        f.graph
            .set_input(a, 0, StreamDescriptor::filter(b, 0), &f.channels)
            .unwrap();
        f.graph
            .set_input(b, 0, StreamDescriptor::filter(a, 0), &f.channels)
            .unwrap();
        f.graph
            .set_input(ok, 0, StreamDescriptor::channel(f.ch, 0), &f.channels)
            .unwrap();
        let tail = f.graph.create("tail", Box::new(Scale::new()));
        f.graph
            .set_input(tail, 0, StreamDescriptor::filter(b, 0), &f.channels)
            .unwrap();

        let err = FilterGraphExecutor::new()
            .run_blocking(&mut f.graph, &mut f.channels, &mut f.ctx)
            .unwrap_err();
        // "tail" only reads from the loop and is not part of it.
        assert_eq!(err, GraphError::Cycle(vec!["a".into(), "b".into()]));
        assert_eq!(err.to_string(), "Filter graph contains a cycle through: a, b");
        assert_eq!(f.graph.node(ok).unwrap().run_count(), 0);
    }

    #[test]
    fn missing_channel_data_fails_node() {
        let mut f = Fixture::new();
        let empty = f.channels.add_channel("scope:CH2", InstrumentId(0), 1, &[("data", StreamKind::Analog)]);
        let a = f.graph.create("a", Box::new(Scale::new()));
        f.graph
            .set_input(a, 0, StreamDescriptor::channel(empty, 0), &f.channels)
            .unwrap();
        let report = f.run(&mut FilterGraphExecutor::new());
        assert!(report.is_failed(a));
        assert!(matches!(f.graph.node(a).unwrap().status(), NodeStatus::Failed(_)));
    }
}
