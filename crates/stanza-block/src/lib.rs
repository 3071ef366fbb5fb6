//! Block-incremental backup primitives.
//!
//! A file is segmented into fixed-size blocks. Each backup stores only the
//! blocks that changed since the prior backup, batched into super-blocks
//! (one compression/encryption unit each), and appends a [`BlockMap`]
//! recording where every logical block physically lives. Restore uses a
//! [`BlockDelta`] to compute the minimal set of physical reads needed to
//! bring a destination file up to date.
//!
//! Per-file repository object layout:
//!
//! ```text
//! <super_block_1> <super_block_2> ... <super_block_n> <block_map>
//! ```
//!
//! Each super-block is a part-framed stream (varint length prefix per part,
//! zero terminator) whose payload is the compressed and optionally
//! encrypted sequence of `<varint block delta> <block bytes>` records. The
//! block map follows, pack encoded, and its byte count is reported as the
//! block-incremental filter's result so it can be located without
//! scanning.

pub mod block_incr;
pub mod delta;
pub mod error;
pub mod map;

pub use block_incr::{BlockIncrFilter, BlockIncrParam, block_checksum_size};
pub use delta::{BlockDelta, BlockDeltaBlock, BlockDeltaRead, BlockDeltaSuperBlock, BlockDeltaWrite};
pub use error::{BlockError, Result};
pub use map::{BlockMap, BlockMapItem};
