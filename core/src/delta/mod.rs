//! Block-matching delta engine.
//!
//! A [`Sequencer`] indexes reference content into fixed-size blocks, a
//! [`DeltaReader`] scans new content against that index and broadcasts
//! literal and matched-block events to [`DeltaProcessor`]s. The
//! [`EncodingProcessor`] turns the stream into a [`DeltaRecord`], which
//! [`DeltaRecord::apply`] replays against the reference to rebuild the
//! new content.

pub mod encoding;
pub mod processor;
pub mod reader;
pub mod rolling;
pub mod sequencer;

pub use encoding::{DeltaRecord, EncodingProcessor, Instruction, ReconstructingProcessor, encode};
pub use processor::{DeltaEvent, DeltaProcessor, DeltaStats, DiagnosticProcessor, EventCollector};
pub use reader::{DeltaReader, DeltaSummary};
pub use rolling::RollingChecksum;
pub use sequencer::{Block, HashIndex, Sequencer};
