use super::processor::DeltaProcessor;
use super::rolling::RollingChecksum;
use super::sequencer::{Block, HashIndex};
use crate::{Error, Result, StrongHash};
use std::io::{ErrorKind, Read};
use std::ops::Range;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Pending literal bytes are flushed once they reach this size.
pub const DEFAULT_LITERAL_LIMIT: usize = 1024 * 1024;

const MIN_READ_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Init,
    Scanning,
    LiteralPending,
    Done,
}

/// Totals of one delta pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaSummary {
    pub total_bytes: u64,
    pub literal_bytes: u64,
    pub matched_blocks: u64,
    pub matched_bytes: u64,
    /// Strong hash of the whole new stream.
    pub content_hash: StrongHash,
}

/// Single-pass scan of a new stream against a reference [`HashIndex`].
///
/// A window of `block_size` bytes slides over the stream. Its weak checksum
/// is updated in constant time per byte; candidates sharing the checksum are
/// confirmed with the strong hash before a match is emitted. Matched windows
/// are skipped whole, unmatched bytes accumulate into literal runs.
pub struct DeltaReader<'a, R> {
    index: &'a HashIndex,
    source: R,
    cancel: Option<CancellationToken>,
    literal_limit: usize,
}

impl<'a, R: Read> DeltaReader<'a, R> {
    pub fn new(index: &'a HashIndex, source: R) -> Self {
        Self {
            index,
            source,
            cancel: None,
            literal_limit: DEFAULT_LITERAL_LIMIT,
        }
    }

    /// Polls `token` at block granularity and aborts the pass once it is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_literal_limit(mut self, limit: usize) -> Self {
        self.literal_limit = limit.max(1);
        self
    }

    pub fn read_into(self, processor: &mut dyn DeltaProcessor) -> Result<DeltaSummary> {
        self.read(&mut [processor])
    }

    /// Runs the pass, broadcasting every event to `processors` in attachment order.
    pub fn read(self, processors: &mut [&mut dyn DeltaProcessor]) -> Result<DeltaSummary> {
        let DeltaReader {
            index,
            source,
            cancel,
            literal_limit,
        } = self;
        let mut out = Fanout { processors };
        let block_size = index.block_size();
        let mut window = Window::new(source, block_size.max(MIN_READ_SIZE));
        let mut state = ReaderState::Init;

        let mut pending: Vec<u8> = Vec::new();
        let mut pending_offset = 0u64;
        let mut offset = 0u64;
        let mut checksum: Option<RollingChecksum> = None;
        let mut reused = vec![false; index.len()];
        let mut content = blake3::Hasher::new();
        let mut since_poll = 0usize;
        let mut literal_bytes = 0u64;
        let mut matched_blocks = 0u64;
        let mut matched_bytes = 0u64;

        check_cancelled(cancel.as_ref())?;
        out.on_begin()?;
        trace!(?state, "delta reader starting");
        state = ReaderState::Scanning;

        loop {
            window.fill(block_size)?;
            let len = window.available().min(block_size);
            if len == 0 {
                break;
            }

            let sum = *checksum.get_or_insert_with(|| RollingChecksum::from_window(window.bytes(len)));
            let found = find_match(index, window.bytes(len), sum.value()).map(|b| (b.index, b.size));

            if let Some((block_index, size)) = found {
                if state == ReaderState::LiteralPending {
                    content.update(&pending);
                    out.on_literal_run(&pending, pending_offset)?;
                    literal_bytes += pending.len() as u64;
                    pending.clear();
                    state = ReaderState::Scanning;
                }
                content.update(window.bytes(len));
                out.on_matched_block(block_index, size)?;
                reused[block_index as usize] = true;
                matched_blocks += 1;
                matched_bytes += size as u64;

                window.advance(len);
                offset += len as u64;
                since_poll += len;
                checksum = None;
            } else {
                let outgoing = window.bytes(1)[0];
                if state != ReaderState::LiteralPending {
                    pending_offset = offset;
                    state = ReaderState::LiteralPending;
                }
                pending.push(outgoing);
                window.advance(1);
                offset += 1;
                since_poll += 1;

                window.fill(block_size)?;
                let next_len = window.available().min(block_size);
                if let Some(sum) = checksum.as_mut() {
                    if next_len == len {
                        sum.roll(outgoing, window.bytes(len)[len - 1]);
                    } else {
                        sum.shrink(outgoing);
                    }
                }

                if pending.len() >= literal_limit {
                    content.update(&pending);
                    out.on_literal_run(&pending, pending_offset)?;
                    literal_bytes += pending.len() as u64;
                    pending.clear();
                    state = ReaderState::Scanning;
                }
            }

            if since_poll >= block_size {
                since_poll = 0;
                check_cancelled(cancel.as_ref())?;
            }
        }

        if state == ReaderState::LiteralPending {
            content.update(&pending);
            out.on_literal_run(&pending, pending_offset)?;
            literal_bytes += pending.len() as u64;
            pending.clear();
        }

        for range in lost_ranges(index.blocks(), &reused) {
            out.on_bytes_lost(range)?;
        }
        out.on_end(literal_bytes)?;
        state = ReaderState::Done;
        trace!(?state, total = offset, literal_bytes, matched_blocks, "delta reader finished");

        Ok(DeltaSummary {
            total_bytes: offset,
            literal_bytes,
            matched_blocks,
            matched_bytes,
            content_hash: StrongHash::new(content.finalize()),
        })
    }
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(Error::Cancelled),
        _ => Ok(()),
    }
}

fn find_match<'i>(index: &'i HashIndex, window: &[u8], weak: u32) -> Option<&'i Block> {
    let mut strong = None;
    for block in index.candidates(weak) {
        if block.size != window.len() {
            continue;
        }
        let hash = *strong.get_or_insert_with(|| StrongHash::from_data(window));
        if block.strong == hash {
            return Some(block);
        }
    }
    None
}

/// Coalesces runs of never-reused blocks into byte ranges of the reference.
fn lost_ranges(blocks: &[Block], reused: &[bool]) -> Vec<Range<u64>> {
    let mut ranges: Vec<Range<u64>> = Vec::new();
    for (block, _) in blocks.iter().zip(reused).filter(|(_, used)| !**used) {
        match ranges.last_mut() {
            Some(last) if last.end == block.offset => last.end = block.end(),
            _ => ranges.push(block.offset..block.end()),
        }
    }
    ranges
}

struct Fanout<'p, 'a> {
    processors: &'p mut [&'a mut dyn DeltaProcessor],
}

impl DeltaProcessor for Fanout<'_, '_> {
    fn on_begin(&mut self) -> Result<()> {
        for p in self.processors.iter_mut() {
            p.on_begin()?;
        }
        Ok(())
    }

    fn on_literal_run(&mut self, bytes: &[u8], offset: u64) -> Result<()> {
        for p in self.processors.iter_mut() {
            p.on_literal_run(bytes, offset)?;
        }
        Ok(())
    }

    fn on_matched_block(&mut self, block_index: u64, length: usize) -> Result<()> {
        for p in self.processors.iter_mut() {
            p.on_matched_block(block_index, length)?;
        }
        Ok(())
    }

    fn on_bytes_lost(&mut self, range: Range<u64>) -> Result<()> {
        for p in self.processors.iter_mut() {
            p.on_bytes_lost(range.clone())?;
        }
        Ok(())
    }

    fn on_end(&mut self, literal_bytes: u64) -> Result<()> {
        for p in self.processors.iter_mut() {
            p.on_end(literal_bytes)?;
        }
        Ok(())
    }
}

/// Read-ahead buffer holding the current window and the bytes after it.
struct Window<R> {
    source: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    read_size: usize,
}

impl<R: Read> Window<R> {
    fn new(source: R, read_size: usize) -> Self {
        Self {
            source,
            buf: Vec::with_capacity(read_size * 2),
            pos: 0,
            eof: false,
            read_size,
        }
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&self, len: usize) -> &[u8] {
        &self.buf[self.pos..self.pos + len]
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn fill(&mut self, want: usize) -> Result<()> {
        while !self.eof && self.available() < want {
            if self.pos >= self.read_size {
                self.buf.drain(..self.pos);
                self.pos = 0;
            }
            let start = self.buf.len();
            self.buf.resize(start + self.read_size, 0);
            match self.source.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    self.eof = true;
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(e) if e.kind() == ErrorKind::Interrupted => self.buf.truncate(start),
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::processor::{DeltaEvent, DiagnosticProcessor, EventCollector};
    use crate::delta::sequencer::Sequencer;
    use std::io;

    fn scan(reference: &[u8], target: &[u8], block_size: usize) -> (EventCollector, DeltaSummary) {
        let index = Sequencer::new(block_size).unwrap().sequence_bytes(reference).unwrap();
        let mut collector = EventCollector::new();
        let summary = DeltaReader::new(&index, target).read_into(&mut collector).unwrap();
        (collector, summary)
    }

    fn replay(reference: &[u8], block_size: usize, events: &[DeltaEvent]) -> Vec<u8> {
        let mut out = Vec::new();
        for event in events {
            match event {
                DeltaEvent::Literal { bytes, .. } => out.extend_from_slice(bytes),
                DeltaEvent::Match { block_index, length } => {
                    let start = *block_index as usize * block_size;
                    out.extend_from_slice(&reference[start..start + length]);
                }
            }
        }
        out
    }

    #[test]
    fn test_insertion_between_blocks() {
        let (collector, summary) = scan(b"ABCDEFGH", b"ABCDXXEFGH", 4);
        assert_eq!(
            collector.events,
            vec![
                DeltaEvent::Match { block_index: 0, length: 4 },
                DeltaEvent::Literal { offset: 4, bytes: b"XX".to_vec() },
                DeltaEvent::Match { block_index: 1, length: 4 },
            ]
        );
        assert_eq!(summary.literal_bytes, 2);
        assert_eq!(summary.total_bytes, 10);
        assert_eq!(replay(b"ABCDEFGH", 4, &collector.events), b"ABCDXXEFGH");
    }

    #[test]
    fn test_identical_content() {
        let (collector, summary) = scan(b"ABCDEFGH", b"ABCDEFGH", 4);
        assert_eq!(
            collector.events,
            vec![
                DeltaEvent::Match { block_index: 0, length: 4 },
                DeltaEvent::Match { block_index: 1, length: 4 },
            ]
        );
        assert_eq!(summary.literal_bytes, 0);
        assert_eq!(collector.literal_bytes, Some(0));
        assert!(collector.lost.is_empty());
    }

    #[test]
    fn test_no_overlap() {
        let (collector, summary) = scan(b"ABCDEFGH", b"ZZZZZZZZ", 4);
        assert_eq!(
            collector.events,
            vec![DeltaEvent::Literal { offset: 0, bytes: b"ZZZZZZZZ".to_vec() }]
        );
        assert_eq!(collector.matches(), 0);
        assert_eq!(summary.literal_bytes, 8);
        assert_eq!(collector.lost, vec![0..8]);
    }

    #[test]
    fn test_short_final_block_matches_at_tail() {
        let (collector, _) = scan(b"ABCDEFGHIJ", b"xABCDEFGHIJ", 4);
        assert_eq!(
            collector.events,
            vec![
                DeltaEvent::Literal { offset: 0, bytes: b"x".to_vec() },
                DeltaEvent::Match { block_index: 0, length: 4 },
                DeltaEvent::Match { block_index: 1, length: 4 },
                DeltaEvent::Match { block_index: 2, length: 2 },
            ]
        );
    }

    #[test]
    fn test_lost_bytes_are_reported() {
        let (collector, _) = scan(b"AAAABBBBCCCCDDDD", b"AAAADDDD", 4);
        assert_eq!(collector.lost, vec![4..12]);
    }

    #[test]
    fn test_empty_target() {
        let (collector, summary) = scan(b"ABCDEFGH", b"", 4);
        assert!(collector.events.is_empty());
        assert_eq!(summary.total_bytes, 0);
        assert_eq!(summary.content_hash, StrongHash::from_data(b""));
    }

    #[test]
    fn test_literal_limit_splits_runs() {
        let index = Sequencer::new(4).unwrap().sequence_bytes(b"ABCD").unwrap();
        let mut collector = EventCollector::new();
        DeltaReader::new(&index, &b"zzzzzzz"[..])
            .with_literal_limit(3)
            .read_into(&mut collector)
            .unwrap();
        let runs: Vec<_> = collector
            .events
            .iter()
            .map(|e| match e {
                DeltaEvent::Literal { offset, bytes } => (*offset, bytes.len()),
                DeltaEvent::Match { .. } => panic!("unexpected match"),
            })
            .collect();
        assert_eq!(runs, vec![(0, 3), (3, 3), (6, 1)]);
    }

    #[test]
    fn test_content_hash_covers_whole_stream() {
        let target = b"ABCDqqEFGHrr";
        let (_, summary) = scan(b"ABCDEFGH", target, 4);
        assert_eq!(summary.content_hash, StrongHash::from_data(target));
    }

    #[test]
    fn test_fanout_reaches_every_processor() {
        let index = Sequencer::new(4).unwrap().sequence_bytes(b"ABCDEFGH").unwrap();
        let mut collector = EventCollector::new();
        let mut diagnostic = DiagnosticProcessor::new("fanout");
        {
            let mut processors: [&mut dyn DeltaProcessor; 2] = [&mut collector, &mut diagnostic];
            DeltaReader::new(&index, &b"ABCDXXEFGH"[..]).read(&mut processors).unwrap();
        }
        assert_eq!(collector.events.len(), 3);
        assert_eq!(diagnostic.stats().matched_blocks, 2);
        assert_eq!(diagnostic.stats().literal_bytes, 2);
    }

    #[test]
    fn test_cancellation_aborts_pass() {
        let index = Sequencer::new(4).unwrap().sequence_bytes(b"ABCDEFGH").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut collector = EventCollector::new();
        let result = DeltaReader::new(&index, &b"ABCDEFGH"[..])
            .with_cancellation(token)
            .read_into(&mut collector);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
    }

    #[test]
    fn test_read_error_aborts_pass() {
        let index = Sequencer::new(4).unwrap().sequence_bytes(b"ABCD").unwrap();
        let mut collector = EventCollector::new();
        let result = DeltaReader::new(&index, FailingReader).read_into(&mut collector);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    /// Hands out one byte per read call.
    struct Trickle<'d>(&'d [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }

    #[test]
    fn test_short_reads_give_same_stream() {
        let reference = b"0123456789abcdefghij".repeat(50);
        let mut target = reference.clone();
        target.splice(300..310, b"--inserted--".iter().copied());

        let index = Sequencer::new(16).unwrap().sequence_bytes(&reference).unwrap();
        let mut whole = EventCollector::new();
        DeltaReader::new(&index, &target[..]).read_into(&mut whole).unwrap();
        let mut trickled = EventCollector::new();
        DeltaReader::new(&index, Trickle(&target)).read_into(&mut trickled).unwrap();

        assert_eq!(whole.events, trickled.events);
        assert_eq!(replay(&reference, 16, &whole.events), target);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn replay_reproduces_target(
                reference in proptest::collection::vec(0u8..4, 0..300),
                target in proptest::collection::vec(0u8..4, 0..300),
                block_size in 1usize..24,
            ) {
                let (collector, summary) = scan(&reference, &target, block_size);
                let rebuilt = replay(&reference, block_size, &collector.events);
                prop_assert_eq!(&rebuilt, &target);
                prop_assert_eq!(summary.total_bytes, target.len() as u64);
            }

            #[test]
            fn edited_copy_reuses_blocks(
                reference in proptest::collection::vec(any::<u8>(), 64..400),
                cut in 0usize..64,
                insert in proptest::collection::vec(any::<u8>(), 0..16),
            ) {
                let mut target = reference.clone();
                let at = cut.min(target.len());
                target.splice(at..at, insert.iter().copied());
                let (collector, _) = scan(&reference, &target, 8);
                prop_assert_eq!(replay(&reference, 8, &collector.events), target);
            }
        }
    }
}
