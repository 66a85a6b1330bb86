//! WAL Reader
//!
//! Forward-only iteration over the archive and work directories. Segment
//! seams (header and switch records) are hidden from the caller, and a
//! partially written trailing record ends its segment without an error.

use memmap2::Mmap;
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::record::{RecordType, WalRecord};
use super::segment::{list_segments, read_frame, Frame, SegmentHeader, HEADER_SIZE};
use super::{parse_segment_index, WalPaths, WalPointer};
use crate::error::{Error, Result};

/// What to do when a segment holds a corrupted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// Fail for archived segments, tolerate for work segments
    #[default]
    Default,
    /// Report the corruption and stop iterating
    Fail,
    /// Log the corruption and continue with the next segment
    Tolerate,
}

/// Where a segment was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentSource {
    Archive,
    Work,
}

impl ReadPolicy {
    fn fails(self, source: SegmentSource) -> bool {
        match self {
            ReadPolicy::Fail => true,
            ReadPolicy::Tolerate => false,
            ReadPolicy::Default => source == SegmentSource::Archive,
        }
    }
}

/// A segment queued for reading
#[derive(Debug, Clone)]
struct PendingSegment {
    path: PathBuf,
    source: SegmentSource,
}

/// The segment being read
struct OpenSegment {
    index: u64,
    source: SegmentSource,
    map: Mmap,
    offset: u64,
}

/// Iterator over `(pointer, record)` pairs across segments
///
/// Each instance is single pass; build a new one to read the log again.
pub struct WalIterator {
    pending: VecDeque<PendingSegment>,
    current: Option<OpenSegment>,
    policy: ReadPolicy,
    failed: bool,
    skipped: u64,
}

impl WalIterator {
    /// Iterate over every segment in an archive directory
    pub fn archive(dir: &Path, policy: ReadPolicy) -> Result<Self> {
        let pending = list_segments(dir)?
            .into_iter()
            .map(|(_, path)| PendingSegment {
                path,
                source: SegmentSource::Archive,
            })
            .collect();
        Ok(Self::with_pending(pending, policy))
    }

    /// Iterate over an explicit list of work-directory segment files
    pub fn work_files(files: Vec<PathBuf>, policy: ReadPolicy) -> Result<Self> {
        let mut files = files;
        files.sort_by_key(|path| parse_segment_index(path));
        let pending = files
            .into_iter()
            .map(|path| PendingSegment {
                path,
                source: SegmentSource::Work,
            })
            .collect();
        Ok(Self::with_pending(pending, policy))
    }

    /// Iterate over the whole log: archived segments, then the work directory
    pub fn open(paths: &WalPaths, policy: ReadPolicy) -> Result<Self> {
        let archived = list_segments(&paths.archive_dir)?;
        let last_archived = archived.last().map(|(idx, _)| *idx);

        let mut pending: VecDeque<PendingSegment> = archived
            .into_iter()
            .map(|(_, path)| PendingSegment {
                path,
                source: SegmentSource::Archive,
            })
            .collect();

        for (index, path) in list_segments(&paths.work_dir)? {
            if last_archived.map_or(false, |last| index <= last) {
                tracing::debug!(segment = index, "Skipping work segment already archived");
                continue;
            }
            pending.push_back(PendingSegment {
                path,
                source: SegmentSource::Work,
            });
        }

        Ok(Self::with_pending(pending, policy))
    }

    fn with_pending(pending: VecDeque<PendingSegment>, policy: ReadPolicy) -> Self {
        Self {
            pending,
            current: None,
            policy,
            failed: false,
            skipped: 0,
        }
    }

    /// Frames skipped because their type is unknown to this build
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Map a segment file, `None` when it is too short to hold a header
    fn open_segment(pending: &PendingSegment) -> Result<Option<OpenSegment>> {
        let file = File::open(&pending.path)?;
        if file.metadata()?.len() < HEADER_SIZE as u64 {
            tracing::debug!(path = %pending.path.display(), "Skipping empty WAL segment");
            return Ok(None);
        }

        // SAFETY: segments are only appended to by the writer; a concurrent
        // append past the mapped length is simply not seen.
        let map = unsafe { Mmap::map(&file)? };
        let header = SegmentHeader::from_bytes(&map)?;

        Ok(Some(OpenSegment {
            index: header.index,
            source: pending.source,
            map,
            offset: HEADER_SIZE as u64,
        }))
    }

    /// Decide between stopping with an error and moving on
    fn corruption(
        &mut self,
        source: SegmentSource,
        segment: u64,
        offset: u64,
        reason: String,
    ) -> Option<Result<(WalPointer, WalRecord)>> {
        if self.policy.fails(source) {
            self.failed = true;
            return Some(Err(Error::WalCorrupted {
                segment,
                offset,
                reason,
            }));
        }

        tracing::warn!(
            segment = segment,
            offset = offset,
            reason = %reason,
            "Skipping rest of corrupted WAL segment"
        );
        None
    }
}

impl Iterator for WalIterator {
    type Item = Result<(WalPointer, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }

            if self.current.is_none() {
                let pending = self.pending.pop_front()?;
                match Self::open_segment(&pending) {
                    Ok(Some(open)) => self.current = Some(open),
                    Ok(None) => {}
                    Err(e) => {
                        let index = parse_segment_index(&pending.path).unwrap_or_default();
                        if let Some(err) = self.corruption(pending.source, index, 0, e.to_string())
                        {
                            return Some(err);
                        }
                    }
                }
                continue;
            }

            let Some(segment) = self.current.as_mut() else {
                continue;
            };

            match read_frame(&segment.map, segment.index, segment.offset) {
                Frame::Record { record, next } => {
                    segment.offset = next;
                    match record.record_type() {
                        RecordType::HeaderRecord => continue,
                        RecordType::SwitchSegment => {
                            self.current = None;
                            continue;
                        }
                        _ => {}
                    }
                    let Some(pointer) = record.pointer() else {
                        continue;
                    };
                    return Some(Ok((pointer, record)));
                }
                Frame::Unknown { tag, next } => {
                    tracing::debug!(
                        segment = segment.index,
                        offset = segment.offset,
                        tag = tag,
                        "Skipping WAL record of unknown type"
                    );
                    segment.offset = next;
                    self.skipped += 1;
                }
                Frame::EndOfData => {
                    self.current = None;
                }
                Frame::Truncated => {
                    tracing::debug!(
                        segment = segment.index,
                        offset = segment.offset,
                        "WAL segment ends in a partial record"
                    );
                    self.current = None;
                }
                Frame::Corrupted(reason) => {
                    let (source, index, offset) = (segment.source, segment.index, segment.offset);
                    self.current = None;
                    if let Some(err) = self.corruption(source, index, offset, reason) {
                        return Some(err);
                    }
                }
            }
        }
    }
}

/// Information about a WAL segment
#[derive(Debug, Clone, serde::Serialize)]
pub struct SegmentInfo {
    pub index: u64,
    pub path: PathBuf,
    pub archived: bool,
    pub sealed: bool,
    pub bytes: u64,
}

/// Describe every segment in both WAL directories
pub fn segment_infos(paths: &WalPaths) -> Result<Vec<SegmentInfo>> {
    let mut infos = Vec::new();

    for (dir, archived) in [(&paths.archive_dir, true), (&paths.work_dir, false)] {
        for (index, path) in list_segments(dir)? {
            let header = super::segment::read_segment_header(&path)?;
            infos.push(SegmentInfo {
                index,
                bytes: std::fs::metadata(&path)?.len(),
                path,
                archived,
                sealed: header.sealed,
            });
        }
    }

    infos.sort_by_key(|info| info.index);
    Ok(infos)
}
