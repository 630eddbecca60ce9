use crate::Result;
use serde::Serialize;
use std::ops::Range;
use tracing::debug;

/// Consumer of the event stream produced by a delta pass.
///
/// Several processors may be attached to one pass; each receives every
/// event in stream order and keeps its own state.
pub trait DeltaProcessor {
    fn on_begin(&mut self) -> Result<()> {
        Ok(())
    }

    /// New bytes with no reference match, starting at `offset` in the new stream.
    fn on_literal_run(&mut self, bytes: &[u8], offset: u64) -> Result<()>;

    /// The next `length` bytes of the new stream equal reference block `block_index`.
    fn on_matched_block(&mut self, block_index: u64, length: usize) -> Result<()>;

    /// Reference bytes in `range` were never reused by the new stream.
    fn on_bytes_lost(&mut self, _range: Range<u64>) -> Result<()> {
        Ok(())
    }

    fn on_end(&mut self, literal_bytes: u64) -> Result<()>;
}

/// One event of a delta stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEvent {
    Literal { offset: u64, bytes: Vec<u8> },
    Match { block_index: u64, length: usize },
}

/// Keeps every literal and match event in order.
#[derive(Debug, Default)]
pub struct EventCollector {
    pub events: Vec<DeltaEvent>,
    pub lost: Vec<Range<u64>>,
    pub literal_bytes: Option<u64>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, DeltaEvent::Match { .. }))
            .count()
    }
}

impl DeltaProcessor for EventCollector {
    fn on_literal_run(&mut self, bytes: &[u8], offset: u64) -> Result<()> {
        self.events.push(DeltaEvent::Literal {
            offset,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn on_matched_block(&mut self, block_index: u64, length: usize) -> Result<()> {
        self.events.push(DeltaEvent::Match { block_index, length });
        Ok(())
    }

    fn on_bytes_lost(&mut self, range: Range<u64>) -> Result<()> {
        self.lost.push(range);
        Ok(())
    }

    fn on_end(&mut self, literal_bytes: u64) -> Result<()> {
        self.literal_bytes = Some(literal_bytes);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeltaStats {
    pub literal_runs: u64,
    pub literal_bytes: u64,
    pub matched_blocks: u64,
    pub matched_bytes: u64,
    pub lost_bytes: u64,
}

impl DeltaStats {
    pub fn merge(&mut self, other: &DeltaStats) {
        self.literal_runs += other.literal_runs;
        self.literal_bytes += other.literal_bytes;
        self.matched_blocks += other.matched_blocks;
        self.matched_bytes += other.matched_bytes;
        self.lost_bytes += other.lost_bytes;
    }
}

/// Reporting processor: traces every event and accumulates statistics.
#[derive(Debug, Default)]
pub struct DiagnosticProcessor {
    label: String,
    stats: DeltaStats,
}

impl DiagnosticProcessor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stats: DeltaStats::default(),
        }
    }

    pub fn stats(&self) -> &DeltaStats {
        &self.stats
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} blocks reused ({} bytes), {} new bytes in {} runs, {} bytes lost",
            self.label,
            self.stats.matched_blocks,
            self.stats.matched_bytes,
            self.stats.literal_bytes,
            self.stats.literal_runs,
            self.stats.lost_bytes
        )
    }
}

impl DeltaProcessor for DiagnosticProcessor {
    fn on_begin(&mut self) -> Result<()> {
        debug!(label = %self.label, "delta pass started");
        Ok(())
    }

    fn on_literal_run(&mut self, bytes: &[u8], offset: u64) -> Result<()> {
        debug!(label = %self.label, from = offset, to = offset + bytes.len() as u64, "new bytes");
        self.stats.literal_runs += 1;
        self.stats.literal_bytes += bytes.len() as u64;
        Ok(())
    }

    fn on_matched_block(&mut self, block_index: u64, length: usize) -> Result<()> {
        debug!(label = %self.label, block = block_index, length, "block found");
        self.stats.matched_blocks += 1;
        self.stats.matched_bytes += length as u64;
        Ok(())
    }

    fn on_bytes_lost(&mut self, range: Range<u64>) -> Result<()> {
        debug!(label = %self.label, from = range.start, to = range.end, "bytes lost");
        self.stats.lost_bytes += range.end - range.start;
        Ok(())
    }

    fn on_end(&mut self, literal_bytes: u64) -> Result<()> {
        debug!(label = %self.label, literal_bytes, "delta pass finished");
        Ok(())
    }
}
