use super::processor::{DeltaProcessor, DeltaStats, DiagnosticProcessor};
use super::reader::{DeltaReader, DeltaSummary};
use super::sequencer::HashIndex;
use crate::{Error, Result, StrongHash};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio_util::sync::CancellationToken;

const RECORD_FORMAT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Copy `count` consecutive reference blocks starting at `block`.
    Copy { block: u64, count: u64 },
    Literal(Vec<u8>),
}

/// Compact, self-verifying encoding of one delta stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub format: u8,
    pub block_size: u32,
    pub base_size: u64,
    pub base_hash: StrongHash,
    pub target_size: u64,
    pub target_hash: StrongHash,
    pub instructions: Vec<Instruction>,
}

impl DeltaRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::DefaultOptions::new()
            .serialize(self)
            .map_err(|e| Error::Other(format!("Failed to encode delta record: {}", e)))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let record: DeltaRecord = bincode::DefaultOptions::new()
            .with_limit(data.len() as u64)
            .deserialize(data)
            .map_err(|e| Error::Corruption(format!("Malformed delta record: {}", e)))?;
        if record.format != RECORD_FORMAT {
            return Err(Error::Corruption(format!(
                "Unsupported delta record format: {}",
                record.format
            )));
        }
        if record.block_size == 0 {
            return Err(Error::Corruption("Delta record has a zero block size".to_string()));
        }
        Ok(record)
    }

    pub fn literal_bytes(&self) -> u64 {
        self.instructions
            .iter()
            .map(|i| match i {
                Instruction::Literal(bytes) => bytes.len() as u64,
                Instruction::Copy { .. } => 0,
            })
            .sum()
    }

    fn block_len(&self, block: u64) -> Result<usize> {
        let start = block
            .checked_mul(u64::from(self.block_size))
            .filter(|start| *start < self.base_size)
            .ok_or_else(|| Error::Corruption(format!("Delta record references missing block {}", block)))?;
        Ok((self.base_size - start).min(u64::from(self.block_size)) as usize)
    }

    /// Feeds the recorded events to `processor` as a live delta pass would.
    pub fn replay(&self, processor: &mut dyn DeltaProcessor) -> Result<()> {
        processor.on_begin()?;
        let mut offset = 0u64;
        let mut literal_bytes = 0u64;
        for instruction in &self.instructions {
            match instruction {
                Instruction::Literal(bytes) => {
                    processor.on_literal_run(bytes, offset)?;
                    offset += bytes.len() as u64;
                    literal_bytes += bytes.len() as u64;
                }
                Instruction::Copy { block, count } => {
                    for index in *block..block.saturating_add(*count) {
                        let length = self.block_len(index)?;
                        processor.on_matched_block(index, length)?;
                        offset += length as u64;
                    }
                }
            }
        }
        processor.on_end(literal_bytes)
    }

    /// Rebuilds the target bytes from `base`, verifying both ends with the strong hash.
    pub fn apply(&self, base: &[u8]) -> Result<Vec<u8>> {
        if base.len() as u64 != self.base_size || StrongHash::from_data(base) != self.base_hash {
            return Err(Error::Corruption(
                "Delta base does not match the recorded reference".to_string(),
            ));
        }

        let capacity = usize::try_from(self.target_size).unwrap_or(0);
        let mut rebuild = ReconstructingProcessor::new(base, self.block_size as usize, Vec::with_capacity(capacity));
        self.replay(&mut rebuild)?;
        let target = rebuild.into_inner();

        if target.len() as u64 != self.target_size || StrongHash::from_data(&target) != self.target_hash {
            return Err(Error::Corruption(
                "Reconstructed content failed strong hash verification".to_string(),
            ));
        }
        Ok(target)
    }
}

/// Serializes the event stream into a [`DeltaRecord`].
#[derive(Debug)]
pub struct EncodingProcessor {
    block_size: usize,
    base_size: u64,
    base_hash: StrongHash,
    instructions: Vec<Instruction>,
    target_size: u64,
}

impl EncodingProcessor {
    pub fn new(index: &HashIndex) -> Self {
        Self {
            block_size: index.block_size(),
            base_size: index.total_len(),
            base_hash: index.content_hash(),
            instructions: Vec::new(),
            target_size: 0,
        }
    }

    pub fn finish(self, summary: &DeltaSummary) -> Result<DeltaRecord> {
        if summary.total_bytes != self.target_size {
            return Err(Error::Other(format!(
                "Delta stream covers {} bytes but the scan read {}",
                self.target_size, summary.total_bytes
            )));
        }
        let block_size = u32::try_from(self.block_size)
            .map_err(|_| Error::Configuration(format!("Block size {} is too large", self.block_size)))?;
        Ok(DeltaRecord {
            format: RECORD_FORMAT,
            block_size,
            base_size: self.base_size,
            base_hash: self.base_hash,
            target_size: self.target_size,
            target_hash: summary.content_hash,
            instructions: self.instructions,
        })
    }
}

impl DeltaProcessor for EncodingProcessor {
    fn on_literal_run(&mut self, bytes: &[u8], _offset: u64) -> Result<()> {
        if let Some(Instruction::Literal(last)) = self.instructions.last_mut() {
            last.extend_from_slice(bytes);
        } else {
            self.instructions.push(Instruction::Literal(bytes.to_vec()));
        }
        self.target_size += bytes.len() as u64;
        Ok(())
    }

    fn on_matched_block(&mut self, block_index: u64, length: usize) -> Result<()> {
        match self.instructions.last_mut() {
            Some(Instruction::Copy { block, count }) if *block + *count == block_index => *count += 1,
            _ => self.instructions.push(Instruction::Copy {
                block: block_index,
                count: 1,
            }),
        }
        self.target_size += length as u64;
        Ok(())
    }

    fn on_end(&mut self, _literal_bytes: u64) -> Result<()> {
        Ok(())
    }
}

/// Writes the target bytes by copying matched blocks out of the reference.
pub struct ReconstructingProcessor<'r, W> {
    reference: &'r [u8],
    block_size: usize,
    sink: W,
    written: u64,
}

impl<'r, W: Write> ReconstructingProcessor<'r, W> {
    pub fn new(reference: &'r [u8], block_size: usize, sink: W) -> Self {
        Self {
            reference,
            block_size,
            sink,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write> DeltaProcessor for ReconstructingProcessor<'_, W> {
    fn on_literal_run(&mut self, bytes: &[u8], _offset: u64) -> Result<()> {
        self.sink.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn on_matched_block(&mut self, block_index: u64, length: usize) -> Result<()> {
        let range = usize::try_from(block_index)
            .ok()
            .and_then(|i| i.checked_mul(self.block_size))
            .and_then(|start| Some(start..start.checked_add(length)?))
            .filter(|range| range.end <= self.reference.len())
            .ok_or_else(|| Error::Corruption(format!("Block {} lies outside the reference", block_index)))?;
        self.sink.write_all(&self.reference[range])?;
        self.written += length as u64;
        Ok(())
    }

    fn on_end(&mut self, _literal_bytes: u64) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }
}

/// Scans `target` against `index` and returns the encoded record plus statistics.
pub fn encode<R: Read>(
    index: &HashIndex,
    target: R,
    label: &str,
    literal_limit: usize,
    cancel: Option<CancellationToken>,
) -> Result<(DeltaRecord, DeltaStats)> {
    let mut encoder = EncodingProcessor::new(index);
    let mut diagnostic = DiagnosticProcessor::new(label);
    let mut reader = DeltaReader::new(index, target).with_literal_limit(literal_limit);
    if let Some(token) = cancel {
        reader = reader.with_cancellation(token);
    }

    let summary = {
        let mut processors: [&mut dyn DeltaProcessor; 2] = [&mut encoder, &mut diagnostic];
        reader.read(&mut processors)?
    };

    let stats = diagnostic.stats().clone();
    Ok((encoder.finish(&summary)?, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::reader::DEFAULT_LITERAL_LIMIT;
    use crate::delta::sequencer::Sequencer;

    fn encode_bytes(reference: &[u8], target: &[u8], block_size: usize) -> DeltaRecord {
        let index = Sequencer::new(block_size).unwrap().sequence_bytes(reference).unwrap();
        encode(&index, target, "test", DEFAULT_LITERAL_LIMIT, None).unwrap().0
    }

    #[test]
    fn test_record_layout() {
        let record = encode_bytes(b"ABCDEFGH", b"ABCDXXEFGH", 4);
        assert_eq!(
            record.instructions,
            vec![
                Instruction::Copy { block: 0, count: 1 },
                Instruction::Literal(b"XX".to_vec()),
                Instruction::Copy { block: 1, count: 1 },
            ]
        );
        assert_eq!(record.target_size, 10);
        assert_eq!(record.literal_bytes(), 2);
    }

    #[test]
    fn test_consecutive_blocks_collapse() {
        let record = encode_bytes(b"ABCDEFGHIJ", b"ABCDEFGHIJ", 4);
        assert_eq!(record.instructions, vec![Instruction::Copy { block: 0, count: 3 }]);
    }

    #[test]
    fn test_apply_through_bytes() {
        let reference = b"The quick brown fox jumps over the lazy dog".repeat(20);
        let mut target = reference.clone();
        target.splice(100..140, b"a rather slow tortoise".iter().copied());
        target.extend_from_slice(b" and then some");

        let record = encode_bytes(&reference, &target, 16);
        let decoded = DeltaRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.apply(&reference).unwrap(), target);
    }

    #[test]
    fn test_apply_rejects_wrong_base() {
        let record = encode_bytes(b"ABCDEFGH", b"ABCDXXEFGH", 4);
        let err = record.apply(b"ABCDEFGX").unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_apply_detects_tampered_literal() {
        let mut record = encode_bytes(b"ABCDEFGH", b"ABCDXXEFGH", 4);
        record.instructions[1] = Instruction::Literal(b"YY".to_vec());
        let err = record.apply(b"ABCDEFGH").unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_out_of_range_block_is_corruption() {
        let mut record = encode_bytes(b"ABCDEFGH", b"ABCDEFGH", 4);
        record.instructions = vec![Instruction::Copy { block: 7, count: 1 }];
        let err = record.apply(b"ABCDEFGH").unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let bytes = encode_bytes(b"ABCDEFGH", b"ABCDXXEFGH", 4).to_bytes().unwrap();
        let err = DeltaRecord::from_bytes(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_reconstructing_processor_attached_to_live_pass() {
        let reference = b"ABCDEFGH";
        let index = Sequencer::new(4).unwrap().sequence_bytes(reference).unwrap();
        let mut rebuild = ReconstructingProcessor::new(reference, 4, Vec::new());
        DeltaReader::new(&index, &b"EFGHzABCD"[..]).read_into(&mut rebuild).unwrap();
        assert_eq!(rebuild.written(), 9);
        assert_eq!(rebuild.into_inner(), b"EFGHzABCD");
    }
}
