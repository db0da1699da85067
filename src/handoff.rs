//! Moves downloaded captures into the channel table and runs the two-phase
//! handshake with the processing thread.
//!
//! ```text
//! handoff thread                     processing thread
//! ──────────────                     ─────────────────
//! wait for captures
//! lock table, publish, unlock
//! ready.signal()  ───────────────►   ready.peek() / ready.block()
//! processed.block() (timed)          lock table, run filter graph
//!                 ◄───────────────   processed.signal()
//! next cycle
//! ```
//! The table is only written between a consumed `processed` and the next
//! `ready`, so the graph always reads complete, simultaneous captures.

use crate::acquisition::InstrumentControl;
use crate::channel::ChannelTable;
use crate::event::{Event, ShutdownFlag};
use crate::instrument::InstrumentId;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long one wait on `processed` lasts before shutdown is checked again.
const PROCESSED_WAIT: Duration = Duration::from_millis(50);

/// The pair of events shared by the handoff and processing threads.
#[derive(Debug, Default)]
pub struct Handshake {
    /// New captures are in the channel table.
    pub ready: Event,
    /// The processing thread is done reading the table.
    pub processed: Event,
}

pub(crate) fn lock_table(table: &Mutex<ChannelTable>) -> MutexGuard<'_, ChannelTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WaveformHandoff {
    instruments: Vec<(InstrumentId, Arc<InstrumentControl>)>,
    channels: Arc<Mutex<ChannelTable>>,
    handshake: Arc<Handshake>,
    poll_interval: Duration,
    cycles: u64,
}

impl WaveformHandoff {
    pub fn new(
        instruments: Vec<(InstrumentId, Arc<InstrumentControl>)>,
        channels: Arc<Mutex<ChannelTable>>,
        handshake: Arc<Handshake>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            instruments,
            channels,
            handshake,
            poll_interval,
            cycles: 0,
        }
    }

    /// At least one instrument has a capture waiting and every instrument that
    /// is still acquiring has one too.
    pub fn captures_ready(&self) -> bool {
        let any = self.instruments.iter().any(|(_, c)| !c.pending.is_empty());
        let all_active = self
            .instruments
            .iter()
            .all(|(_, c)| !c.state().is_active() || !c.pending.is_empty());
        any && all_active
    }

    /// Move one capture per instrument into the channel table under a single
    /// lock. Returns the number of waveforms written.
    pub fn publish(&mut self) -> usize {
        let mut table = lock_table(&self.channels);
        let mut written = 0;
        for (id, control) in &self.instruments {
            let Some(set) = control.pending.pop() else {
                continue;
            };
            for (index, waveform) in set.waveforms {
                match table.lookup(*id, index) {
                    Some(ch) => {
                        table.set_waveform(ch, 0, waveform);
                        written += 1;
                    }
                    None => warn!("{}: no channel {} in table, dropping", control.name, index),
                }
            }
        }
        self.cycles += 1;
        written
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Loop until shutdown: wait for captures, publish, signal ready, then
    /// wait for the processing thread to let go of the table.
    pub fn run(mut self, shutdown: ShutdownFlag) {
        info!("Waveform handoff thread started");
        'outer: loop {
            if shutdown.is_requested() {
                break;
            }
            if !self.captures_ready() {
                if shutdown.sleep(self.poll_interval) {
                    break;
                }
                continue;
            }

            let written = self.publish();
            debug!("Cycle {}: published {} waveforms", self.cycles, written);
            self.handshake.ready.signal();

            while !self.handshake.processed.block_timeout(PROCESSED_WAIT) {
                if shutdown.is_requested() {
                    break 'outer;
                }
            }
        }
        info!("Waveform handoff thread exited after {} cycles", self.cycles);
    }
}
