//! Pagination of a region set into bounded chunks.

/// Regions per chunk when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Half-open index range `[start, end)` of the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    pub start: usize,
    /// Also the offset to pass to the next call.
    pub end: usize,
    /// True once `end` reaches the total.
    pub completed: bool,
}

impl ChunkBounds {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Next chunk of a set of `total` regions starting at `offset` (0 when `None`).
///
/// Repeated calls feeding `end` back as the offset visit every index exactly once. An empty
/// set is completed immediately.
pub fn next_chunk(offset: Option<usize>, total: usize, chunk_size: usize) -> ChunkBounds {
    let start = offset.unwrap_or(0).min(total);
    let end = start.saturating_add(chunk_size.max(1)).min(total);
    ChunkBounds {
        start,
        end,
        completed: end == total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_cover_set_once() {
        let mut offset = None;
        let mut seen = Vec::new();
        loop {
            let chunk = next_chunk(offset, 4500, DEFAULT_CHUNK_SIZE);
            seen.push((chunk.start, chunk.end, chunk.completed));
            if chunk.completed {
                break;
            }
            offset = Some(chunk.end);
        }
        assert_eq!(
            seen,
            vec![(0, 2000, false), (2000, 4000, false), (4000, 4500, true)]
        );
    }

    #[test]
    fn test_exact_multiple() {
        let first = next_chunk(None, 4000, 2000);
        let second = next_chunk(Some(first.end), 4000, 2000);
        assert!(!first.completed);
        assert!(second.completed);
        assert_eq!(second.len(), 2000);
    }

    #[test]
    fn test_empty_set_completes_immediately() {
        let chunk = next_chunk(None, 0, 2000);
        assert!(chunk.completed);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_offset_past_end_is_clamped() {
        let chunk = next_chunk(Some(10), 5, 2000);
        assert_eq!((chunk.start, chunk.end), (5, 5));
        assert!(chunk.completed);
    }
}
