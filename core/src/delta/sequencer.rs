use super::rolling::weak_checksum;
use crate::{Error, Result, StrongHash};
use std::collections::HashMap;
use std::io::{ErrorKind, Read};

/// One fixed-size chunk of reference content. The last block may be shorter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub offset: u64,
    pub size: usize,
    pub weak: u32,
    pub strong: StrongHash,
}

impl Block {
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
}

/// Blocks of one reference stream, looked up by weak checksum.
///
/// Blocks cover the reference exactly once, contiguous and in offset order.
#[derive(Debug, Clone)]
pub struct HashIndex {
    block_size: usize,
    blocks: Vec<Block>,
    by_weak: HashMap<u32, Vec<usize>>,
    total_len: u64,
    content_hash: StrongHash,
}

impl HashIndex {
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    /// Candidate blocks sharing `weak`, in increasing index order.
    pub fn candidates(&self, weak: u32) -> impl Iterator<Item = &Block> {
        self.by_weak
            .get(&weak)
            .into_iter()
            .flatten()
            .map(|&i| &self.blocks[i])
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Length of the reference content in bytes.
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Strong hash of the whole reference content.
    pub fn content_hash(&self) -> StrongHash {
        self.content_hash
    }
}

/// Splits reference content into blocks and indexes them.
#[derive(Debug, Clone, Copy)]
pub struct Sequencer {
    block_size: usize,
}

impl Sequencer {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::Configuration("block size must be at least 1 byte".to_string()));
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sequence_bytes(&self, data: &[u8]) -> Result<HashIndex> {
        self.sequence(data)
    }

    pub fn sequence<R: Read>(&self, mut reader: R) -> Result<HashIndex> {
        let mut blocks = Vec::new();
        let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut content = blake3::Hasher::new();
        let mut buffer = vec![0u8; self.block_size];
        let mut offset = 0u64;

        loop {
            let filled = read_full(&mut reader, &mut buffer)?;
            if filled == 0 {
                break;
            }
            let data = &buffer[..filled];
            content.update(data);

            let block = Block {
                index: blocks.len() as u64,
                offset,
                size: filled,
                weak: weak_checksum(data),
                strong: StrongHash::from_data(data),
            };
            by_weak.entry(block.weak).or_default().push(blocks.len());
            offset += filled as u64;
            blocks.push(block);

            if filled < self.block_size {
                break;
            }
        }

        Ok(HashIndex {
            block_size: self.block_size,
            blocks,
            by_weak,
            total_len: offset,
            content_hash: StrongHash::new(content.finalize()),
        })
    }
}

/// Reads until `buffer` is full or the stream ends; returns the bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_cover_reference() {
        let index = Sequencer::new(4).unwrap().sequence_bytes(b"ABCDEFGHIJ").unwrap();

        let sizes: Vec<_> = index.blocks().iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let mut expected_offset = 0;
        for (i, block) in index.blocks().iter().enumerate() {
            assert_eq!(block.index, i as u64);
            assert_eq!(block.offset, expected_offset);
            expected_offset = block.end();
        }
        assert_eq!(index.total_len(), 10);
        assert_eq!(index.content_hash(), StrongHash::from_data(b"ABCDEFGHIJ"));
    }

    #[test]
    fn test_collision_chain_keeps_order() {
        // Identical blocks always share a weak checksum.
        let index = Sequencer::new(2).unwrap().sequence_bytes(b"xyxyxy").unwrap();
        let chain: Vec<_> = index.candidates(weak_checksum(b"xy")).map(|b| b.index).collect();
        assert_eq!(chain, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_reference() {
        let index = Sequencer::new(8).unwrap().sequence_bytes(b"").unwrap();
        assert!(index.is_empty());
        assert_eq!(index.total_len(), 0);
    }

    #[test]
    fn test_zero_block_size_is_rejected() {
        assert!(matches!(Sequencer::new(0), Err(Error::Configuration(_))));
    }
}
