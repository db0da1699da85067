//! References to data streams owned by channels or filters.

use std::fmt;

/// Index of an instrument channel in the session's channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

/// Index of a filter node in the filter graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub usize);

/// The object that owns a stream's waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamOwner {
    Channel(ChannelId),
    Filter(FilterId),
}

/// A (owner, stream index) pair used to wire filter inputs.
///
/// The descriptor is a plain index and never keeps its owner alive.
/// Equality is owner identity plus stream index, which makes it usable as a
/// dependency-graph edge key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamDescriptor {
    pub owner: StreamOwner,
    pub stream: usize,
}

impl StreamDescriptor {
    pub fn channel(channel: ChannelId, stream: usize) -> Self {
        Self {
            owner: StreamOwner::Channel(channel),
            stream,
        }
    }

    pub fn filter(filter: FilterId, stream: usize) -> Self {
        Self {
            owner: StreamOwner::Filter(filter),
            stream,
        }
    }

    /// The filter this stream comes from, if it is a filter output.
    pub fn source_filter(&self) -> Option<FilterId> {
        match self.owner {
            StreamOwner::Filter(id) => Some(id),
            StreamOwner::Channel(_) => None,
        }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            StreamOwner::Channel(ChannelId(c)) => write!(f, "channel {}.{}", c, self.stream),
            StreamOwner::Filter(FilterId(n)) => write!(f, "filter {}.{}", n, self.stream),
        }
    }
}

/// Identity of the waveform currently published on a stream.
///
/// `generation` changes whenever the stream gets a different waveform object,
/// `revision` whenever that object's contents change. Together they tell the
/// executor whether a consumer has already seen this data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamVersion {
    pub generation: u64,
    pub revision: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_is_owner_and_index() {
        let a = StreamDescriptor::channel(ChannelId(1), 0);
        let b = StreamDescriptor::channel(ChannelId(1), 0);
        let c = StreamDescriptor::channel(ChannelId(1), 1);
        let d = StreamDescriptor::filter(FilterId(1), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn source_filter() {
        assert_eq!(StreamDescriptor::filter(FilterId(4), 2).source_filter(), Some(FilterId(4)));
        assert_eq!(StreamDescriptor::channel(ChannelId(4), 0).source_filter(), None);
    }
}
