use crate::config::ConfigErrors;
use itertools::Itertools;

pub type Chunk<T> = Vec<T>;

/// Split `items` into contiguous chunks of `chunk_size`, only the last chunk may be shorter.
///
/// Concatenating the chunks in order yields `items` again, the launcher relies on this to map
/// job results back to global task indices.
pub fn partition<T>(items: Vec<T>, chunk_size: usize) -> Result<Vec<Chunk<T>>, ConfigErrors> {
    if chunk_size == 0 {
        return Err(ConfigErrors::InvalidChunkSize(chunk_size));
    }

    let chunks = items.into_iter().chunks(chunk_size);
    let chunks = chunks
        .into_iter()
        .map(|chunk| chunk.collect_vec())
        .collect_vec();

    Ok(chunks)
}

/// number of chunks `partition` creates for `count` items
pub fn chunk_count(count: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        0
    } else {
        count.div_ceil(chunk_size)
    }
}
