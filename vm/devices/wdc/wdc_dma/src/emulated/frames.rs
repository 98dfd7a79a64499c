// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page frame allocator for the emulated physical address space.
// The allocator tracks which frames of a fixed range are in use without
// backing them with memory. It is not synchronized; the emulated service
// calls it under its state lock.

/// A run of consecutive page frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct FrameRange {
    pub start: u64,
    pub count: u64,
}

impl FrameRange {
    pub fn end(&self) -> u64 {
        self.start + self.count
    }
}

pub(crate) struct FrameAllocator {
    // Sorted by start, never adjacent.
    free_list: Vec<FrameRange>,
}

impl FrameAllocator {
    pub fn new(base_pfn: u64, count: u64) -> Self {
        Self {
            free_list: vec![FrameRange {
                start: base_pfn,
                count,
            }],
        }
    }

    /// Number of frames not allocated.
    pub fn free_frames(&self) -> u64 {
        self.free_list.iter().map(|r| r.count).sum()
    }

    /// Allocates `count` frames whose first frame number is a multiple of
    /// `align`, taking the lowest fit.
    pub fn alloc(&mut self, count: u64, align: u64) -> Option<FrameRange> {
        let align = align.max(1);
        let (pos, start) = self.free_list.iter().enumerate().find_map(|(pos, block)| {
            let start = block.start.next_multiple_of(align);
            (start + count <= block.end()).then_some((pos, start))
        })?;

        let block = self.free_list.remove(pos);
        let allocated = FrameRange { start, count };
        let tail = FrameRange {
            start: allocated.end(),
            count: block.end() - allocated.end(),
        };
        let head = FrameRange {
            start: block.start,
            count: start - block.start,
        };
        for piece in [tail, head] {
            if piece.count != 0 {
                self.free_list.insert(pos, piece);
            }
        }
        Some(allocated)
    }

    /// Allocates `count` frames from the top of the highest free block.
    pub fn alloc_top(&mut self, count: u64) -> Option<FrameRange> {
        let pos = self.free_list.iter().rposition(|block| block.count >= count)?;
        let block = &mut self.free_list[pos];
        block.count -= count;
        let allocated = FrameRange {
            start: block.end(),
            count,
        };
        if block.count == 0 {
            self.free_list.remove(pos);
        }
        Some(allocated)
    }

    pub fn free(&mut self, range: FrameRange) {
        let pos = match self
            .free_list
            .binary_search_by_key(&range.start, |b| b.start)
        {
            Ok(pos) | Err(pos) => pos,
        };
        debug_assert!(
            pos == 0 || self.free_list[pos - 1].end() <= range.start,
            "double free of {range:?}"
        );
        self.free_list.insert(pos, range);

        // Merge with the next block if adjacent.
        if pos + 1 < self.free_list.len()
            && self.free_list[pos].end() == self.free_list[pos + 1].start
        {
            self.free_list[pos].count += self.free_list[pos + 1].count;
            self.free_list.remove(pos + 1);
        }

        // Merge with the previous block if adjacent.
        if pos > 0 && self.free_list[pos - 1].end() == self.free_list[pos].start {
            self.free_list[pos - 1].count += self.free_list[pos].count;
            self.free_list.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn test_allocator_initialization() {
        let allocator = FrameAllocator::new(0x100, 64);
        assert_eq!(allocator.free_list.len(), 1);
        assert_eq!(allocator.free_frames(), 64);
    }

    #[test]
    fn test_alloc_lowest_fit() {
        let mut allocator = FrameAllocator::new(0x100, 64);
        let range = allocator.alloc(16, 1).unwrap();
        assert_eq!(range, FrameRange { start: 0x100, count: 16 });
        assert_eq!(allocator.free_list, [FrameRange { start: 0x110, count: 48 }]);
    }

    #[test]
    fn test_alloc_fail() {
        let mut allocator = FrameAllocator::new(0, 8);
        assert!(allocator.alloc(9, 1).is_none());
        assert!(allocator.alloc_top(9).is_none());
    }

    #[test]
    fn test_aligned_alloc_splits_block() {
        let mut allocator = FrameAllocator::new(0x101, 63);
        let range = allocator.alloc(4, 16).unwrap();
        assert_eq!(range.start, 0x110);
        assert_eq!(
            allocator.free_list,
            [
                FrameRange { start: 0x101, count: 15 },
                FrameRange { start: 0x114, count: 44 },
            ]
        );
        allocator.free(range);
        assert_eq!(allocator.free_list, [FrameRange { start: 0x101, count: 63 }]);
    }

    #[test]
    fn test_alloc_top_descends() {
        let mut allocator = FrameAllocator::new(0, 8);
        let first = allocator.alloc_top(1).unwrap();
        let second = allocator.alloc_top(1).unwrap();
        assert_eq!(first.start, 7);
        assert_eq!(second.start, 6);
        allocator.free(first);
        allocator.free(second);
        assert_eq!(allocator.free_list, [FrameRange { start: 0, count: 8 }]);
    }

    #[test]
    fn test_out_of_order_allocation_and_free() {
        let mut allocator = FrameAllocator::new(0, 64);

        let range1 = allocator.alloc(16, 1).unwrap();
        let range2 = allocator.alloc(32, 1).unwrap();
        let range3 = allocator.alloc(8, 1).unwrap();
        assert_eq!(range2.start, 16);
        assert_eq!(range3.start, 48);

        allocator.free(range2);
        assert_eq!(allocator.free_list.len(), 2);

        let range4 = allocator.alloc(32, 1).unwrap();
        assert_eq!(range4.start, 16);

        allocator.free(range1);
        allocator.free(range3);
        allocator.free(range4);
        assert_eq!(allocator.free_list, [FrameRange { start: 0, count: 64 }]);
    }

    #[test]
    fn test_freeing_non_contiguous_blocks() {
        let mut allocator = FrameAllocator::new(0, 64);

        let range1 = allocator.alloc(8, 1).unwrap();
        let _range2 = allocator.alloc(16, 1).unwrap();
        let range3 = allocator.alloc(8, 1).unwrap();

        allocator.free(range1);
        allocator.free(range3);

        // The freed ranges are separated by the live one.
        assert_eq!(allocator.free_list.len(), 2);
        assert_eq!(allocator.free_frames(), 48);
    }
}
