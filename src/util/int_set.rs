//! Compact set of `u32` values
//!
//! Values are grouped into segments of 1024. A sparse segment stores its
//! offsets in a sorted array; once it would hold more than [`THRESHOLD`]
//! values it switches to a 1024-bit bitmap, and switches back when it drops
//! below the threshold again.

use std::collections::BTreeMap;

/// Values per segment
pub const SEGMENT_SIZE: u32 = 1024;

/// Largest array segment
pub const THRESHOLD: usize = 64;

const WORDS: usize = SEGMENT_SIZE as usize / 64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Array(Vec<u16>),
    Bitmap { words: Box<[u64; WORDS]>, count: usize },
}

impl Segment {
    fn len(&self) -> usize {
        match self {
            Segment::Array(values) => values.len(),
            Segment::Bitmap { count, .. } => *count,
        }
    }

    fn contains(&self, offset: u16) -> bool {
        match self {
            Segment::Array(values) => values.binary_search(&offset).is_ok(),
            Segment::Bitmap { words, .. } => {
                words[offset as usize / 64] & (1u64 << (offset % 64)) != 0
            }
        }
    }

    fn insert(&mut self, offset: u16) -> bool {
        match self {
            Segment::Array(values) => {
                let Err(pos) = values.binary_search(&offset) else {
                    return false;
                };
                if values.len() < THRESHOLD {
                    values.insert(pos, offset);
                    return true;
                }
                let mut words = Box::new([0u64; WORDS]);
                for v in values.iter() {
                    words[*v as usize / 64] |= 1u64 << (v % 64);
                }
                let count = values.len();
                *self = Segment::Bitmap { words, count };
                self.insert(offset)
            }
            Segment::Bitmap { words, count } => {
                let bit = 1u64 << (offset % 64);
                let word = &mut words[offset as usize / 64];
                if *word & bit != 0 {
                    return false;
                }
                *word |= bit;
                *count += 1;
                true
            }
        }
    }

    fn remove(&mut self, offset: u16) -> bool {
        match self {
            Segment::Array(values) => match values.binary_search(&offset) {
                Ok(pos) => {
                    values.remove(pos);
                    true
                }
                Err(_) => false,
            },
            Segment::Bitmap { words, count } => {
                let bit = 1u64 << (offset % 64);
                let word = &mut words[offset as usize / 64];
                if *word & bit == 0 {
                    return false;
                }
                *word &= !bit;
                *count -= 1;
                if *count < THRESHOLD {
                    let values = SegmentIter::bitmap(words).collect();
                    *self = Segment::Array(values);
                }
                true
            }
        }
    }

    fn iter(&self) -> SegmentIter<'_> {
        match self {
            Segment::Array(values) => SegmentIter::Array(values.iter()),
            Segment::Bitmap { words, .. } => SegmentIter::bitmap(words),
        }
    }
}

enum SegmentIter<'a> {
    Array(std::slice::Iter<'a, u16>),
    Bitmap {
        words: &'a [u64; WORDS],
        index: usize,
        current: u64,
    },
}

impl<'a> SegmentIter<'a> {
    fn bitmap(words: &'a [u64; WORDS]) -> Self {
        SegmentIter::Bitmap {
            words,
            index: 0,
            current: words[0],
        }
    }
}

impl Iterator for SegmentIter<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        match self {
            SegmentIter::Array(iter) => iter.next().copied(),
            SegmentIter::Bitmap {
                words,
                index,
                current,
            } => loop {
                if *current != 0 {
                    let bit = current.trailing_zeros();
                    *current &= *current - 1;
                    return Some((*index * 64) as u16 + bit as u16);
                }
                *index += 1;
                if *index >= WORDS {
                    return None;
                }
                *current = words[*index];
            },
        }
    }
}

/// Set of `u32` values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntSet {
    segments: BTreeMap<u32, Segment>,
    len: usize,
}

fn split(value: u32) -> (u32, u16) {
    (value / SEGMENT_SIZE, (value % SEGMENT_SIZE) as u16)
}

impl IntSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, returning whether it was new
    pub fn insert(&mut self, value: u32) -> bool {
        let (key, offset) = split(value);
        let added = self
            .segments
            .entry(key)
            .or_insert_with(|| Segment::Array(Vec::new()))
            .insert(offset);
        if added {
            self.len += 1;
        }
        added
    }

    /// Remove a value, returning whether it was present
    pub fn remove(&mut self, value: u32) -> bool {
        let (key, offset) = split(value);
        let Some(segment) = self.segments.get_mut(&key) else {
            return false;
        };
        let removed = segment.remove(offset);
        if removed {
            self.len -= 1;
            if segment.len() == 0 {
                self.segments.remove(&key);
            }
        }
        removed
    }

    pub fn contains(&self, value: u32) -> bool {
        let (key, offset) = split(value);
        self.segments
            .get(&key)
            .map_or(false, |segment| segment.contains(offset))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }

    /// Values in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.segments.iter().flat_map(|(key, segment)| {
            let base = key * SEGMENT_SIZE;
            segment.iter().map(move |offset| base + offset as u32)
        })
    }
}

impl FromIterator<u32> for IntSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = IntSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<u32> for IntSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        for value in iter {
            self.insert(value);
        }
    }
}
