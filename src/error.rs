//! Error types for acquisition, waveforms and the filter graph

use crate::stream::{FilterId, StreamDescriptor};

/// Errors reported by an instrument driver
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InstrumentError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out waiting for instrument")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Instrument is disconnected")]
    Disconnected,
}

/// Errors raised while building or validating waveform data
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WaveformError {
    #[error("Sparse arrays differ in length (offsets {offsets}, durations {durations}, samples {samples})")]
    LengthMismatch {
        offsets: usize,
        durations: usize,
        samples: usize,
    },

    #[error("Sample {index} at offset {offset} overlaps or precedes the previous sample ending at {previous_end}")]
    OffsetOrder {
        index: usize,
        offset: i64,
        previous_end: i64,
    },
}

/// Errors a filter node reports from its refresh
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Input '{0}' is not connected")]
    MissingInput(String),

    #[error("Input '{0}' has no waveform")]
    NoData(String),

    #[error("Input '{input}' expected {expected} data")]
    WrongInputType { input: String, expected: &'static str },

    #[error("Parameter '{name}': {reason}")]
    BadParameter { name: String, reason: String },

    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("Cannot read '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Upstream filter '{0}' failed")]
    UpstreamFailed(String),

    #[error(transparent)]
    Waveform(#[from] WaveformError),
}

/// Errors for graph construction and execution ordering
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Filter graph contains a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Filter {0:?} does not exist")]
    InvalidFilter(FilterId),

    #[error("Stream {0} does not exist")]
    InvalidStream(StreamDescriptor),

    #[error("Filter '{filter}' has no input named '{input}'")]
    NoSuchInput { filter: String, input: String },

    #[error("Filter '{filter}' input '{input}' cannot accept {kind} data")]
    KindMismatch {
        filter: String,
        input: String,
        kind: &'static str,
    },
}

/// Errors while turning a config file into a running session
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown filter kind '{0}'")]
    UnknownFilterKind(String),

    #[error("Cannot resolve stream reference '{0}'")]
    UnresolvedStream(String),

    #[error("Duplicate name '{0}'")]
    DuplicateName(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}
