//! WAL record body codec
//!
//! Explicit, versioned binary encoding for every record payload. Fixed fields
//! are big-endian; variable fields carry an `i32` length prefix where `-1`
//! marks an absent value and `0` a present but empty one. Fields introduced by
//! a later format version are only read from (and written to) streams of that
//! version, so older logs stay readable.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use super::record::*;
use super::WalPointer;
use crate::checkpoint::FullPageId;
use crate::error::{Error, Result};

/// Current record format version
pub const FORMAT_VERSION: u8 = 2;

/// Oldest format version this build reads
pub const MIN_FORMAT_VERSION: u8 = 1;

/// Length prefix marking an absent collection or string
const ABSENT: i32 = -1;

/// Encode a payload body under `version`
pub fn encode_payload(payload: &RecordPayload, version: u8, out: &mut Vec<u8>) -> Result<()> {
    match payload {
        RecordPayload::Tx(r) => {
            out.write_u8(r.state as u8)?;
            write_uuid(out, &r.xid);
            write_string_list(out, r.participating_nodes.as_deref())?;
            out.write_i64::<BigEndian>(r.timestamp)?;
        }
        RecordPayload::PageSnapshot(r) => {
            write_page_id(out, r.page)?;
            write_bytes(out, Some(&r.data))?;
        }
        RecordPayload::Data(r) => {
            write_len(out, r.entries.len())?;
            for entry in &r.entries {
                out.write_i32::<BigEndian>(entry.group_id)?;
                out.write_u8(entry.op as u8)?;
                out.write_u32::<BigEndian>(entry.partition)?;
                out.write_u64::<BigEndian>(entry.partition_counter)?;
                write_bytes(out, Some(&entry.key))?;
                write_bytes(out, entry.value.as_deref())?;
            }
        }
        RecordPayload::StoreOperation(r) => {
            out.write_u8(r.op as u8)?;
            out.write_i32::<BigEndian>(r.group_id)?;
            out.write_i64::<BigEndian>(r.link)?;
            out.write_i32::<BigEndian>(r.index_id)?;
        }
        RecordPayload::Checkpoint(r) => {
            write_uuid(out, &r.checkpoint_id);
            write_pointer(out, r.mark)?;
            out.write_u8(r.end as u8)?;
            if version >= 2 {
                out.write_u32::<BigEndian>(r.page_count)?;
            }
        }
        RecordPayload::Header(r) => {
            out.write_u64::<BigEndian>(r.segment)?;
            out.write_u8(r.format_version)?;
        }
        RecordPayload::InitNewPage(r) => {
            write_page_id(out, r.page)?;
            out.write_u16::<BigEndian>(r.io_type)?;
            out.write_u16::<BigEndian>(r.io_version)?;
        }
        RecordPayload::PageDelta(r) => {
            write_page_id(out, r.page)?;
            out.write_u16::<BigEndian>(r.offset)?;
            write_bytes(out, Some(&r.payload))?;
        }
        RecordPayload::PageErase(r) => {
            write_page_id(out, r.page)?;
            out.write_u16::<BigEndian>(r.offset)?;
            out.write_u16::<BigEndian>(r.len)?;
        }
        RecordPayload::PartitionCounters(r) => {
            out.write_i32::<BigEndian>(r.group_id)?;
            out.write_u32::<BigEndian>(r.partition)?;
            out.write_u64::<BigEndian>(r.update_counter)?;
            out.write_u64::<BigEndian>(r.global_remove_id)?;
            out.write_u32::<BigEndian>(r.size)?;
        }
        RecordPayload::PartitionState(r) => {
            out.write_i32::<BigEndian>(r.group_id)?;
            out.write_u32::<BigEndian>(r.partition)?;
            out.write_u8(r.state as u8)?;
            out.write_u64::<BigEndian>(r.update_counter)?;
        }
        RecordPayload::PartitionDestroy(r) => {
            out.write_i32::<BigEndian>(r.group_id)?;
            out.write_u32::<BigEndian>(r.partition)?;
        }
        RecordPayload::MemoryRecovery(r) => {
            out.write_i64::<BigEndian>(r.timestamp)?;
        }
        RecordPayload::Exchange(r) => {
            out.write_u8(r.kind as u8)?;
            write_string(out, r.const_id.as_deref())?;
            if version >= 2 {
                out.write_i64::<BigEndian>(r.timestamp)?;
            }
        }
        RecordPayload::SwitchSegment => {}
    }
    Ok(())
}

/// Decode a payload body written under `version`
///
/// Returns `Ok(None)` for record types that carry no replayable payload.
/// Bytes past the fields known to this build are ignored.
pub fn decode_payload(
    record_type: RecordType,
    version: u8,
    body: &[u8],
) -> Result<Option<RecordPayload>> {
    if version < MIN_FORMAT_VERSION {
        return Err(Error::Codec(format!("Unsupported format version {}", version)));
    }

    let mut r = BodyReader::new(body);

    let payload = match record_type {
        RecordType::TxRecord => {
            let state = r.u8()?;
            RecordPayload::Tx(TxRecord {
                state: TxState::from_ordinal(state).ok_or_else(|| bad_ordinal("tx state", state))?,
                xid: r.uuid()?,
                participating_nodes: r.string_list()?,
                timestamp: r.i64()?,
            })
        }
        RecordType::PageRecord => RecordPayload::PageSnapshot(PageSnapshot {
            page: r.page_id()?,
            data: r.required_bytes()?,
        }),
        RecordType::DataRecord => {
            let count = r.len()?.unwrap_or(0);
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let group_id = r.i32()?;
                let op = r.u8()?;
                entries.push(DataEntry {
                    group_id,
                    op: DataOp::from_ordinal(op).ok_or_else(|| bad_ordinal("data op", op))?,
                    partition: r.u32()?,
                    partition_counter: r.u64()?,
                    key: r.required_bytes()?,
                    value: r.bytes()?,
                });
            }
            RecordPayload::Data(DataRecord { entries })
        }
        RecordType::CheckpointRecord => RecordPayload::Checkpoint(CheckpointMarker {
            checkpoint_id: r.uuid()?,
            mark: r.pointer()?,
            end: r.u8()? != 0,
            page_count: if version >= 2 { r.u32()? } else { 0 },
        }),
        RecordType::HeaderRecord => RecordPayload::Header(HeaderRecord {
            segment: r.u64()?,
            format_version: r.u8()?,
        }),
        RecordType::DataPageRemove => RecordPayload::PageErase(PageErase {
            page: r.page_id()?,
            offset: r.u16()?,
            len: r.u16()?,
        }),
        RecordType::PartitionMetaPageUpdateCounters => {
            RecordPayload::PartitionCounters(PartitionCounters {
                group_id: r.i32()?,
                partition: r.u32()?,
                update_counter: r.u64()?,
                global_remove_id: r.u64()?,
                size: r.u32()?,
            })
        }
        RecordType::PartMetaUpdateState => {
            let group_id = r.i32()?;
            let partition = r.u32()?;
            let state = r.u8()?;
            RecordPayload::PartitionState(PartitionStateUpdate {
                group_id,
                partition,
                state: PartitionState::from_ordinal(state)
                    .ok_or_else(|| bad_ordinal("partition state", state))?,
                update_counter: r.u64()?,
            })
        }
        RecordType::PartitionDestroy => RecordPayload::PartitionDestroy(PartitionDestroy {
            group_id: r.i32()?,
            partition: r.u32()?,
        }),
        RecordType::MemoryRecovery => RecordPayload::MemoryRecovery(MemoryRecovery {
            timestamp: r.i64()?,
        }),
        RecordType::Exchange => {
            let kind = r.u8()?;
            RecordPayload::Exchange(ExchangeRecord {
                kind: ExchangeType::from_ordinal(kind)
                    .ok_or_else(|| bad_ordinal("exchange type", kind))?,
                const_id: r.string()?,
                timestamp: if version >= 2 { r.i64()? } else { 0 },
            })
        }
        RecordType::SwitchSegment => RecordPayload::SwitchSegment,
        RecordType::StoreOperationRecord => {
            let op = r.u8()?;
            RecordPayload::StoreOperation(StoreOperation {
                op: StoreOpType::from_ordinal(op).ok_or_else(|| bad_ordinal("store operation", op))?,
                group_id: r.i32()?,
                link: r.i64()?,
                index_id: r.i32()?,
            })
        }
        t if t.is_page_init() => RecordPayload::InitNewPage(InitNewPage {
            page: r.page_id()?,
            io_type: r.u16()?,
            io_version: r.u16()?,
        }),
        t if t.is_page_delta() => RecordPayload::PageDelta(PageDelta {
            page: r.page_id()?,
            offset: r.u16()?,
            payload: r.required_bytes()?,
        }),
        _ => return Ok(None),
    };

    Ok(Some(payload))
}

fn bad_ordinal(field: &str, ordinal: u8) -> Error {
    Error::Codec(format!("Unknown {} ordinal {}", field, ordinal))
}

pub(crate) fn write_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| Error::Codec(format!("Length {} exceeds i32 range", len)))?;
    out.write_i32::<BigEndian>(len)?;
    Ok(())
}

pub(crate) fn write_bytes(out: &mut Vec<u8>, bytes: Option<&[u8]>) -> Result<()> {
    match bytes {
        Some(bytes) => {
            write_len(out, bytes.len())?;
            out.extend_from_slice(bytes);
        }
        None => out.write_i32::<BigEndian>(ABSENT)?,
    }
    Ok(())
}

pub(crate) fn write_string(out: &mut Vec<u8>, s: Option<&str>) -> Result<()> {
    write_bytes(out, s.map(str::as_bytes))
}

pub(crate) fn write_string_list(out: &mut Vec<u8>, list: Option<&[String]>) -> Result<()> {
    match list {
        Some(items) => {
            write_len(out, items.len())?;
            for item in items {
                write_string(out, Some(item))?;
            }
        }
        None => out.write_i32::<BigEndian>(ABSENT)?,
    }
    Ok(())
}

fn write_uuid(out: &mut Vec<u8>, id: &Uuid) {
    out.extend_from_slice(id.as_bytes());
}

fn write_page_id(out: &mut Vec<u8>, page: FullPageId) -> Result<()> {
    out.write_i32::<BigEndian>(page.group_id)?;
    out.write_u32::<BigEndian>(page.page_idx)?;
    Ok(())
}

fn write_pointer(out: &mut Vec<u8>, pointer: Option<WalPointer>) -> Result<()> {
    match pointer {
        Some(p) => {
            out.write_u8(1)?;
            out.write_u64::<BigEndian>(p.segment)?;
            out.write_u64::<BigEndian>(p.offset)?;
            out.write_u32::<BigEndian>(p.len)?;
        }
        None => out.write_u8(0)?,
    }
    Ok(())
}

/// Cursor over an encoded body
pub(crate) struct BodyReader<'a> {
    buf: &'a [u8],
}

fn truncated(e: std::io::Error) -> Error {
    Error::Codec(format!("Record body too short: {}", e))
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.buf.read_u8().map_err(truncated)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.buf.read_u16::<BigEndian>().map_err(truncated)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.buf.read_u32::<BigEndian>().map_err(truncated)
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        self.buf.read_i32::<BigEndian>().map_err(truncated)
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.buf.read_u64::<BigEndian>().map_err(truncated)
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        self.buf.read_i64::<BigEndian>().map_err(truncated)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Codec(format!(
                "Record body too short: need {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Length prefix, `None` when absent
    pub(crate) fn len(&mut self) -> Result<Option<usize>> {
        match self.i32()? {
            ABSENT => Ok(None),
            n if n < 0 => Err(Error::Codec(format!("Negative length prefix {}", n))),
            n => Ok(Some(n as usize)),
        }
    }

    pub(crate) fn bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.len()? {
            Some(n) => Ok(Some(self.take(n)?.to_vec())),
            None => Ok(None),
        }
    }

    pub(crate) fn required_bytes(&mut self) -> Result<Vec<u8>> {
        self.bytes()?
            .ok_or_else(|| Error::Codec("Missing required byte field".into()))
    }

    pub(crate) fn string(&mut self) -> Result<Option<String>> {
        match self.bytes()? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|e| Error::Codec(format!("Invalid UTF-8 string: {}", e))),
            None => Ok(None),
        }
    }

    pub(crate) fn string_list(&mut self) -> Result<Option<Vec<String>>> {
        let Some(count) = self.len()? else {
            return Ok(None);
        };
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let item = self
                .string()?
                .ok_or_else(|| Error::Codec("Absent string inside list".into()))?;
            items.push(item);
        }
        Ok(Some(items))
    }

    pub(crate) fn uuid(&mut self) -> Result<Uuid> {
        let raw = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(Uuid::from_bytes(bytes))
    }

    pub(crate) fn page_id(&mut self) -> Result<FullPageId> {
        Ok(FullPageId::new(self.i32()?, self.u32()?))
    }

    pub(crate) fn pointer(&mut self) -> Result<Option<WalPointer>> {
        match self.u8()? {
            0 => Ok(None),
            _ => Ok(Some(WalPointer::new(self.u64()?, self.u64()?, self.u32()?))),
        }
    }
}
