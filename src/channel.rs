//! Channel slots written by acquisition and read by the filter graph.

use crate::instrument::InstrumentId;
use crate::stream::{ChannelId, StreamVersion};
use crate::waveform::{StreamKind, Waveform};

/// One output stream of a channel and the waveform currently published on it.
#[derive(Debug)]
pub struct StreamSlot {
    pub name: String,
    pub kind: StreamKind,
    data: Option<Waveform>,
    generation: u64,
}

impl StreamSlot {
    pub fn waveform(&self) -> Option<&Waveform> {
        self.data.as_ref()
    }

    pub fn version(&self) -> Option<StreamVersion> {
        self.data.as_ref().map(|w| StreamVersion {
            generation: self.generation,
            revision: w.revision(),
        })
    }
}

/// A channel of some instrument.
#[derive(Debug)]
pub struct ChannelEntry {
    /// Display name, `instrument:channel`.
    pub name: String,
    pub instrument: InstrumentId,
    /// Channel index on the instrument.
    pub index: usize,
    pub streams: Vec<StreamSlot>,
}

/// All channels of all instruments in a session.
///
/// The acquisition handoff writes into it only between a "processed" signal
/// and the next "ready" signal, so readers holding the table during a filter
/// graph run always see complete captures.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: Vec<ChannelEntry>,
    next_generation: u64,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(
        &mut self,
        name: impl Into<String>,
        instrument: InstrumentId,
        index: usize,
        streams: &[(&str, StreamKind)],
    ) -> ChannelId {
        let id = ChannelId(self.channels.len());
        self.channels.push(ChannelEntry {
            name: name.into(),
            instrument,
            index,
            streams: streams
                .iter()
                .map(|(name, kind)| StreamSlot {
                    name: name.to_string(),
                    kind: *kind,
                    data: None,
                    generation: 0,
                })
                .collect(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: ChannelId) -> Option<&ChannelEntry> {
        self.channels.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &ChannelEntry)> {
        self.channels.iter().enumerate().map(|(i, c)| (ChannelId(i), c))
    }

    pub fn find(&self, name: &str) -> Option<ChannelId> {
        self.channels.iter().position(|c| c.name == name).map(ChannelId)
    }

    /// Channel `index` of `instrument`.
    pub fn lookup(&self, instrument: InstrumentId, index: usize) -> Option<ChannelId> {
        self.channels
            .iter()
            .position(|c| c.instrument == instrument && c.index == index)
            .map(ChannelId)
    }

    pub fn slot(&self, id: ChannelId, stream: usize) -> Option<&StreamSlot> {
        self.channels.get(id.0)?.streams.get(stream)
    }

    pub fn waveform(&self, id: ChannelId, stream: usize) -> Option<&Waveform> {
        self.slot(id, stream)?.waveform()
    }

    /// Mutable access for in-place domain preparation. Does not change the version.
    pub fn waveform_mut(&mut self, id: ChannelId, stream: usize) -> Option<&mut Waveform> {
        self.channels.get_mut(id.0)?.streams.get_mut(stream)?.data.as_mut()
    }

    pub fn version(&self, id: ChannelId, stream: usize) -> Option<StreamVersion> {
        self.slot(id, stream)?.version()
    }

    /// Publish a fresh waveform on a stream, replacing the old one.
    /// Returns the waveform it replaced.
    pub fn set_waveform(
        &mut self,
        id: ChannelId,
        stream: usize,
        waveform: Waveform,
    ) -> Option<Waveform> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let slot = self.channels.get_mut(id.0)?.streams.get_mut(stream)?;
        slot.generation = generation;
        slot.data.replace(waveform)
    }

    pub fn take_waveform(&mut self, id: ChannelId, stream: usize) -> Option<Waveform> {
        self.channels.get_mut(id.0)?.streams.get_mut(stream)?.data.take()
    }
}
