use scopecore::channel::ChannelTable;
use scopecore::error::GraphError;
use scopecore::filter::{
    Capabilities, ExecutionContext, FilterGraph, FilterGraphExecutor, NodeStatus,
};
use scopecore::filters::FilterRegistry;
use scopecore::instrument::InstrumentId;
use scopecore::stream::{ChannelId, FilterId, StreamDescriptor};
use scopecore::waveform::{StreamKind, UniformAnalogWaveform};

struct Chain {
    table: ChannelTable,
    graph: FilterGraph,
    ctx: ExecutionContext,
    ch: ChannelId,
    a: FilterId,
    b: FilterId,
    c: FilterId,
}

fn publish(table: &mut ChannelTable, ch: ChannelId, values: Vec<f32>) {
    table.set_waveform(ch, 0, UniformAnalogWaveform::from_samples(1_000, values).into());
}

/// channel -> a (scale) -> b (scale) -> c (rms)
fn chain() -> Chain {
    let registry = FilterRegistry::with_builtin();
    let mut table = ChannelTable::new();
    let ch = table.add_channel("scope:CH1", InstrumentId(0), 0, &[("data", StreamKind::Analog)]);
    publish(&mut table, ch, vec![1.0, -1.0, 1.0, -1.0]);

    let mut graph = FilterGraph::new();
    // Created in reverse so id order differs from dependency order.
    let c = graph.create("c", registry.create("rms").unwrap());
    let b = graph.create("b", registry.create("scale").unwrap());
    let a = graph.create("a", registry.create("scale").unwrap());
    graph
        .set_input_by_name(a, "in", StreamDescriptor::channel(ch, 0), &table)
        .unwrap();
    graph
        .set_input_by_name(b, "in", StreamDescriptor::filter(a, 0), &table)
        .unwrap();
    graph
        .set_input_by_name(c, "in", StreamDescriptor::filter(b, 0), &table)
        .unwrap();

    Chain {
        table,
        graph,
        ctx: ExecutionContext::new(Capabilities::cpu_only()),
        ch,
        a,
        b,
        c,
    }
}

impl Chain {
    fn run(&mut self, executor: &mut FilterGraphExecutor) -> scopecore::filter::ExecutionReport {
        executor
            .run_blocking(&mut self.graph, &mut self.table, &mut self.ctx)
            .unwrap()
    }

    fn revision(&self, id: FilterId) -> u64 {
        self.graph.data(StreamDescriptor::filter(id, 0)).unwrap().revision()
    }
}

#[test]
fn sources_run_before_consumers() {
    let mut chain = chain();
    let report = chain.run(&mut FilterGraphExecutor::new());
    assert_eq!(report.order, vec![chain.a, chain.b, chain.c]);
    assert_eq!(report.ran, vec![chain.a, chain.b, chain.c]);
    for id in [chain.a, chain.b, chain.c] {
        assert_eq!(chain.graph.node(id).unwrap().status(), &NodeStatus::Ok);
    }
}

#[test]
fn unchanged_chain_is_skipped_until_a_source_changes() {
    let mut chain = chain();
    let mut executor = FilterGraphExecutor::new();
    chain.run(&mut executor);
    let before = [chain.revision(chain.a), chain.revision(chain.b), chain.revision(chain.c)];

    let report = chain.run(&mut executor);
    assert!(report.ran.is_empty());
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(
        [chain.revision(chain.a), chain.revision(chain.b), chain.revision(chain.c)],
        before
    );

    // A parameter change in the middle reruns it and everything below it.
    chain
        .graph
        .node_mut(chain.b)
        .unwrap()
        .filter_mut()
        .parameters_mut()
        .parse_and_set("gain", "2")
        .unwrap();
    let report = chain.run(&mut executor);
    assert_eq!(report.ran, vec![chain.b, chain.c]);
    assert_eq!(report.skipped, vec![chain.a]);

    // New data on the channel reruns the whole chain.
    publish(&mut chain.table, chain.ch, vec![3.0, -3.0]);
    let report = chain.run(&mut executor);
    assert_eq!(report.ran, vec![chain.a, chain.b, chain.c]);
    let rms = chain.graph.node(chain.c).unwrap().filter().as_measurement().unwrap();
    assert_eq!(rms.value(), Some(6.0));
}

#[test]
fn always_recompute_gives_identical_output() {
    let mut chain = chain();
    let mut executor = FilterGraphExecutor::always_recompute();
    chain.run(&mut executor);
    let first = chain.graph.data(StreamDescriptor::filter(chain.b, 0)).unwrap().clone();
    let report = chain.run(&mut executor);
    assert_eq!(report.ran.len(), 3);

    let mut first = first;
    let mut second = chain.graph.data(StreamDescriptor::filter(chain.b, 0)).unwrap().clone();
    first.prepare_for_cpu_access();
    second.prepare_for_cpu_access();
    assert_eq!(
        first.analog_samples().unwrap().as_slice(),
        second.analog_samples().unwrap().as_slice()
    );
    assert_eq!(second.revision(), first.revision() + 1);
}

#[test]
fn feedback_loop_is_reported_as_cycle() {
    let mut chain = chain();
    let (a, c) = (chain.a, chain.c);
    // a reads b's output instead of the channel: a -> b -> a
    let b_out = StreamDescriptor::filter(chain.b, 0);
    chain.graph.set_input_by_name(a, "in", b_out, &chain.table).unwrap();

    let err = FilterGraphExecutor::new()
        .run_blocking(&mut chain.graph, &mut chain.table, &mut chain.ctx)
        .unwrap_err();
    match err {
        GraphError::Cycle(names) => {
            assert!(names.contains(&"a".to_string()));
            assert!(names.contains(&"b".to_string()));
            // c only consumes the loop's output.
            assert!(!names.contains(&"c".to_string()));
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
    // Nothing ran.
    assert_eq!(chain.graph.node(c).unwrap().run_count(), 0);
}

#[test]
fn releasing_the_tail_tears_down_the_chain() {
    let mut chain = chain();
    // Every node but c is held by the session reference and its consumer.
    assert_eq!(chain.graph.node(chain.a).unwrap().refcount(), 2);
    assert_eq!(chain.graph.node(chain.c).unwrap().refcount(), 1);

    chain.graph.release(chain.a).unwrap();
    chain.graph.release(chain.b).unwrap();
    assert_eq!(chain.graph.len(), 3);

    assert!(chain.graph.release(chain.c).unwrap());
    assert!(chain.graph.is_empty());
}
