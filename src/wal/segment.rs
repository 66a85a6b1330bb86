//! WAL Segment Management
//!
//! Handles individual WAL segment files and the record frame format.
//!
//! Frame layout (big-endian):
//! `[tag: u8][version: u8][flags: u8][position: u64][size: u32][body][crc32: u32]`
//!
//! `tag` is the record type ordinal plus one so that zeroed, preallocated
//! space reads as "no more records". `size` covers the whole frame and the
//! checksum covers everything before it.

use bytes::{Buf, BufMut, BytesMut};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::codec::{self, FORMAT_VERSION};
use super::record::{RecordType, WalRecord};
use super::{parse_segment_index, WalPointer};
use crate::error::{Error, Result};

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"WOLFPAGE";

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Bytes in front of the record body
pub const FRAME_HEADER_SIZE: usize = 1 + 1 + 1 + 8 + 4;

/// Frame header plus trailing checksum
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 4;

/// Bodies shorter than this are never compressed
const COMPRESS_MIN_BODY: usize = 128;

/// Frame flag: body is LZ4 compressed
const FLAG_LZ4: u8 = 0x01;

/// Segment file header
#[derive(Debug, Clone)]
pub struct SegmentHeader {
    /// Segment index
    pub index: u64,
    /// Whether this segment is sealed (no more writes)
    pub sealed: bool,
}

impl SegmentHeader {
    /// Create header for a new segment
    pub fn new(index: u64) -> Self {
        Self {
            index,
            sealed: false,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.index.to_le_bytes());
        bytes[20] = self.sealed as u8;
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Wal("Segment header too short".into()));
        }

        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Wal("Invalid segment magic bytes".into()));
        }

        let version = LittleEndian::read_u32(&bytes[8..12]);
        if version != SEGMENT_VERSION {
            return Err(Error::Wal(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        Ok(Self {
            index: LittleEndian::read_u64(&bytes[12..20]),
            sealed: bytes[20] != 0,
        })
    }
}

/// Result of decoding the frame at one offset
#[derive(Debug)]
pub enum Frame {
    /// A complete, valid record (pointer assigned)
    Record { record: WalRecord, next: u64 },
    /// A valid frame of a type this build cannot decode
    Unknown { tag: u8, next: u64 },
    /// Zero tag or end of the buffer
    EndOfData,
    /// The frame runs past the end of the buffer
    Truncated,
    /// Checksum, position or body mismatch
    Corrupted(String),
}

/// Encode a record as a frame starting at `position`
pub fn encode_frame(record: &WalRecord, position: u64, compress: bool) -> Result<BytesMut> {
    let mut body = Vec::new();
    codec::encode_payload(record.payload(), FORMAT_VERSION, &mut body)?;

    let mut flags = 0u8;
    if compress && body.len() >= COMPRESS_MIN_BODY {
        body = lz4_flex::compress_prepend_size(&body);
        flags |= FLAG_LZ4;
    }

    let size = FRAME_OVERHEAD + body.len();
    let size = u32::try_from(size)
        .map_err(|_| Error::Wal(format!("Record of {} bytes is too large", size)))?;

    let mut frame = BytesMut::with_capacity(size as usize);
    frame.put_u8(record.record_type().ordinal() + 1);
    frame.put_u8(FORMAT_VERSION);
    frame.put_u8(flags);
    frame.put_u64(position);
    frame.put_u32(size);
    frame.put_slice(&body);
    let checksum = crc32fast::hash(&frame);
    frame.put_u32(checksum);

    Ok(frame)
}

/// Decode the frame at `offset` of a segment image
pub fn read_frame(buf: &[u8], segment: u64, offset: u64) -> Frame {
    let start = offset as usize;
    if start >= buf.len() {
        return Frame::EndOfData;
    }

    let rest = &buf[start..];
    if rest[0] == 0 {
        return Frame::EndOfData;
    }
    if rest.len() < FRAME_HEADER_SIZE {
        return Frame::Truncated;
    }

    let mut header = &rest[..FRAME_HEADER_SIZE];
    let tag = header.get_u8();
    let version = header.get_u8();
    let flags = header.get_u8();
    let position = header.get_u64();
    let size = header.get_u32() as usize;

    if size < FRAME_OVERHEAD {
        return Frame::Corrupted(format!("frame size {} below minimum", size));
    }
    if rest.len() < size {
        return Frame::Truncated;
    }

    let frame = &rest[..size];
    let stored = (&frame[size - 4..]).get_u32();
    if crc32fast::hash(&frame[..size - 4]) != stored {
        return Frame::Corrupted("checksum mismatch".into());
    }
    if position != offset {
        return Frame::Corrupted(format!(
            "frame claims position {} but sits at {}",
            position, offset
        ));
    }

    let next = offset + size as u64;
    let Some(record_type) = RecordType::from_ordinal(tag - 1) else {
        return Frame::Unknown { tag, next };
    };

    let raw = &frame[FRAME_HEADER_SIZE..size - 4];
    let decompressed;
    let body = if flags & FLAG_LZ4 != 0 {
        match lz4_flex::decompress_size_prepended(raw) {
            Ok(data) => {
                decompressed = data;
                &decompressed[..]
            }
            Err(e) => return Frame::Corrupted(format!("decompression failed: {}", e)),
        }
    } else {
        raw
    };

    match codec::decode_payload(record_type, version, body) {
        Ok(Some(payload)) => {
            let mut record = match WalRecord::new(record_type, payload) {
                Ok(record) => record,
                Err(e) => return Frame::Corrupted(e.to_string()),
            };
            if let Err(e) = record.assign_pointer(WalPointer::new(segment, offset, size as u32)) {
                return Frame::Corrupted(e.to_string());
            }
            Frame::Record { record, next }
        }
        Ok(None) => Frame::Unknown { tag, next },
        Err(e) => Frame::Corrupted(e.to_string()),
    }
}

/// A single WAL segment file
pub struct Segment {
    /// Segment index
    pub index: u64,
    /// File path
    pub path: PathBuf,
    /// File handle
    file: File,
    /// Current write position
    write_pos: u64,
    /// Segment header
    header: SegmentHeader,
    /// Maximum segment size in bytes
    max_size: u64,
    /// Frames in this segment
    records: u64,
}

impl Segment {
    /// Create a new segment file
    pub fn create(path: PathBuf, index: u64, max_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut segment = Self {
            index,
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            header: SegmentHeader::new(index),
            max_size,
            records: 0,
        };

        segment.write_header()?;

        Ok(segment)
    }

    /// Open an existing segment file
    ///
    /// Frames are scanned from the start; anything after the last complete
    /// frame is the remainder of an interrupted write and gets cut off.
    pub fn open(path: PathBuf, max_size: u64) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        let header = SegmentHeader::from_bytes(&image)?;

        let mut pos = HEADER_SIZE as u64;
        let mut records = 0;
        let stop = loop {
            match read_frame(&image, header.index, pos) {
                Frame::Record { next, .. } | Frame::Unknown { next, .. } => {
                    pos = next;
                    records += 1;
                }
                other => break other,
            }
        };

        if pos < image.len() as u64 {
            tracing::warn!(
                segment = header.index,
                valid_bytes = pos,
                file_bytes = image.len(),
                stop = ?stop,
                "Truncating incomplete WAL segment tail"
            );
            file.set_len(pos)?;
            file.sync_all()?;
        }

        Ok(Self {
            index: header.index,
            path,
            file,
            write_pos: pos,
            header,
            max_size,
            records,
        })
    }

    /// Append a record if it fits with `reserve` bytes to spare
    ///
    /// Returns `Ok(None)` without writing when the segment is too full.
    pub fn try_append(
        &mut self,
        record: &mut WalRecord,
        compress: bool,
        reserve: u64,
    ) -> Result<Option<WalPointer>> {
        if self.header.sealed {
            return Err(Error::Wal(format!("Segment {} is sealed", self.index)));
        }
        if let Some(existing) = record.pointer() {
            return Err(Error::Wal(format!(
                "Record {} already appended at {}",
                record.record_type(),
                existing
            )));
        }

        let frame = encode_frame(record, self.write_pos, compress)?;
        if self.write_pos + frame.len() as u64 + reserve > self.max_size {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&frame)?;

        let pointer = WalPointer::new(self.index, self.write_pos, frame.len() as u32);
        record.assign_pointer(pointer)?;

        self.write_pos += frame.len() as u64;
        self.records += 1;

        Ok(Some(pointer))
    }

    /// Sync segment to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Seal the segment (no more writes)
    pub fn seal(&mut self) -> Result<()> {
        self.header.sealed = true;
        self.write_header()?;
        self.sync()
    }

    /// Check if segment is sealed
    pub fn is_sealed(&self) -> bool {
        self.header.sealed
    }

    /// Offset the next frame will be written at
    pub fn write_pos(&self) -> u64 {
        self.write_pos
    }

    /// Frames written to this segment, including the header record
    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Write header to file
    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }
}

/// Read just the header of a segment file
pub fn read_segment_header(path: &Path) -> Result<SegmentHeader> {
    let mut file = File::open(path)?;
    let mut bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut bytes)?;
    SegmentHeader::from_bytes(&bytes)
}

/// List all segment files in a directory, ordered by index
pub fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(index) = parse_segment_index(&path) {
            segments.push((index, path));
        }
    }

    segments.sort();
    Ok(segments)
}
