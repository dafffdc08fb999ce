//! Table metadata, typed key values, chunks and chunkers.

mod chunk;
mod chunker;
mod composite;
mod datum;
mod info;
mod optimistic;

pub use chunk::{expand_row_comparison, Boundary, Chunk};
pub use chunker::{
    new_chunker, new_composite_chunker, Chunker, ChunkerProgress, HighWatermark,
    DEFAULT_TARGET_CHUNK_TIME, MAX_CHUNK_SIZE, MAX_DYNAMIC_STEP_FACTOR, MIN_CHUNK_SIZE,
    STARTING_CHUNK_SIZE,
};
pub(crate) use chunker::ChunkSizer;
pub use composite::CompositeChunker;
pub use datum::{Datum, DatumType};
pub use info::TableInfo;
pub use optimistic::OptimisticChunker;
