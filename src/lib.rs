//! Acquisition and signal-processing core of a multi-instrument scope.
//!
//! Instruments are polled on their own threads; downloaded captures are
//! published into a shared channel table through a two-phase handshake, and
//! a filter graph of processing nodes runs over them once per cycle.

pub mod acquisition;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod filters;
pub mod handoff;
pub mod instrument;
pub mod mock;
pub mod session;
pub mod stream;
pub mod tui;
pub mod utils;
pub mod waveform;

pub use acquisition::{AcqEvent, AcquisitionSettings, AcquisitionState, InstrumentWorker};
pub use buffer::{AcceleratorBuffer, AccessHint, MemoryMode};
pub use channel::ChannelTable;
pub use config::Conf;
pub use error::{ConfigError, FilterError, GraphError, InstrumentError, WaveformError};
pub use event::{Event, ShutdownFlag};
pub use filter::{Capabilities, ExecutionContext, Filter, FilterGraph, FilterGraphExecutor};
pub use filters::FilterRegistry;
pub use instrument::{Instrument, InstrumentId, TriggerMode, TriggerStatus};
pub use mock::MockInstrument;
pub use session::Session;
pub use stream::{ChannelId, FilterId, StreamDescriptor};
pub use utils::Counter;
pub use waveform::{StreamKind, UniformAnalogWaveform, Waveform};
