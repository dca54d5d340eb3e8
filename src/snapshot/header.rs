//! Snapshot file header and host runtime metrics.
//!
//! The header is the fixed 174-byte preamble of a snapshot file: magic,
//! byte-order mark, timing, trigger cause, GC cause string, and heap /
//! metaspace sizes. The layout is bit-exact and packed; integers are
//! written in host byte order and disambiguated by the byte-order mark,
//! so a reader on a foreign-endian machine swaps on decode.

use bitflags::bitflags;

/// Fixed capacity of the GC-cause string buffer.
pub const GC_CAUSE_BUFFER: usize = 80;

/// Encoded size of the header in bytes.
pub const HEADER_BYTES: usize = 174;

/// Byte-order mark written by little-endian hosts.
const BYTE_ORDER_LITTLE: u8 = b'L';
/// Byte-order mark written by big-endian hosts.
const BYTE_ORDER_BIG: u8 = b'B';

#[cfg(target_endian = "little")]
const NATIVE_BOM: u8 = BYTE_ORDER_LITTLE;
#[cfg(target_endian = "big")]
const NATIVE_BOM: u8 = BYTE_ORDER_BIG;

bitflags! {
    /// Snapshot format magic.
    ///
    /// Bit 7 marks the 2.0 format (snapshot plus metaspace data); bit 0
    /// marks a reference-tree payload following each class entry. Bits
    /// 1–6 are reserved and must be zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SnapshotFlags: u8 {
        /// Format 2.0.
        const FORMAT_2_0 = 0b1000_0000;
        /// Reference-tree payload present.
        const REF_TREE = 0b0000_0001;
    }
}

/// What triggered a snapshot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCause {
    /// Not yet stamped.
    Unknown = 0,
    /// Interval timer.
    Interval = 1,
    /// Garbage-collection cycle.
    Gc = 2,
    /// Explicit dump request.
    DataDump = 3,
    /// Resource exhaustion (OOM about to be thrown).
    ResourceExhaustion = 4,
}

impl TryFrom<u32> for TriggerCause {
    type Error = HeaderError;

    fn try_from(raw: u32) -> Result<Self, HeaderError> {
        match raw {
            0 => Ok(TriggerCause::Unknown),
            1 => Ok(TriggerCause::Interval),
            2 => Ok(TriggerCause::Gc),
            3 => Ok(TriggerCause::DataDump),
            4 => Ok(TriggerCause::ResourceExhaustion),
            other => Err(HeaderError::BadCause(other)),
        }
    }
}

// =============================================================================
// JvmInfo
// =============================================================================

/// GC and heap metrics sampled from the host runtime.
///
/// Plain data carrier filled by the attach glue; [`apply`] copies it into
/// a header.
///
/// [`apply`]: SnapshotHeader::apply_jvm_info
#[derive(Debug, Clone, Default)]
pub struct JvmInfo {
    /// Cause string of the most recent GC.
    pub gc_cause: String,
    /// Time the most recent GC spent working, in milliseconds.
    pub gc_work_time: i64,
    /// Full-GC count since host start.
    pub full_gc_count: i64,
    /// Young-GC count since host start.
    pub young_gc_count: i64,
    /// Bytes used in the new area.
    pub new_area_size: i64,
    /// Bytes used in the old area.
    pub old_area_size: i64,
    /// Metaspace bytes in use.
    pub metaspace_usage: i64,
    /// Metaspace capacity in bytes.
    pub metaspace_capacity: i64,
}

// =============================================================================
// SnapshotHeader
// =============================================================================

/// The snapshot file header.
///
/// Filled progressively while a snapshot is collected and frozen at
/// handoff; [`encode`](Self::encode) produces the packed on-disk form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Format magic.
    pub magic: SnapshotFlags,
    /// Snapshot time in milliseconds since the host epoch.
    pub snapshot_time: i64,
    /// Number of class entries that follow the header.
    pub entry_count: i64,
    /// What triggered this snapshot.
    pub cause: TriggerCause,
    gc_cause_len: i64,
    gc_cause: [u8; GC_CAUSE_BUFFER],
    /// Full-GC count at snapshot time.
    pub full_gc_count: i64,
    /// Young-GC count at snapshot time.
    pub young_gc_count: i64,
    /// GC work time in milliseconds.
    pub gc_work_time: i64,
    /// Bytes used in the new area.
    pub new_area_size: i64,
    /// Bytes used in the old area.
    pub old_area_size: i64,
    /// Total heap size in bytes.
    pub total_heap_size: i64,
    /// Metaspace bytes in use.
    pub metaspace_usage: i64,
    /// Metaspace capacity in bytes.
    pub metaspace_capacity: i64,
}

impl SnapshotHeader {
    /// Create a header with the given format magic and everything else
    /// in its empty form.
    pub fn new(magic: SnapshotFlags) -> Self {
        SnapshotHeader {
            magic,
            snapshot_time: 0,
            entry_count: 0,
            cause: TriggerCause::Unknown,
            gc_cause_len: 1,
            gc_cause: [0; GC_CAUSE_BUFFER],
            full_gc_count: 0,
            young_gc_count: 0,
            gc_work_time: 0,
            new_area_size: 0,
            old_area_size: 0,
            total_heap_size: 0,
            metaspace_usage: 0,
            metaspace_capacity: 0,
        }
    }

    /// Set the GC cause string, truncating to fit the buffer.
    ///
    /// The buffer always stays NUL-terminated; an empty cause is encoded
    /// as a single NUL with length 1.
    pub fn set_gc_cause(&mut self, cause: &str) {
        let bytes = cause.as_bytes();
        let len = bytes.len().min(GC_CAUSE_BUFFER - 1);
        self.gc_cause = [0; GC_CAUSE_BUFFER];
        self.gc_cause[..len].copy_from_slice(&bytes[..len]);
        self.gc_cause_len = len.max(1) as i64;
    }

    /// Reset the GC cause to its empty form.
    pub fn clear_gc_cause(&mut self) {
        self.gc_cause = [0; GC_CAUSE_BUFFER];
        self.gc_cause_len = 1;
    }

    /// GC cause bytes, without padding.
    pub fn gc_cause(&self) -> &[u8] {
        let len = self.gc_cause_len.clamp(1, GC_CAUSE_BUFFER as i64) as usize;
        if len == 1 && self.gc_cause[0] == 0 {
            &[]
        } else {
            &self.gc_cause[..len]
        }
    }

    /// Encoded length of the GC cause (≥ 1; 1 encodes the empty cause).
    #[inline]
    pub fn gc_cause_len(&self) -> i64 {
        self.gc_cause_len
    }

    /// Copy the host runtime's metrics into this header.
    ///
    /// The GC cause string and work time are meaningful only when this
    /// snapshot was triggered by a GC; for any other cause both are reset
    /// to their empty forms. The total heap size is deliberately not
    /// touched here: querying it may itself trigger a GC on some hosts,
    /// so it is stamped separately outside any GC-entry context.
    pub fn apply_jvm_info(&mut self, info: &JvmInfo) {
        if self.cause == TriggerCause::Gc {
            self.set_gc_cause(&info.gc_cause);
            self.gc_work_time = info.gc_work_time;
        } else {
            self.clear_gc_cause();
            self.gc_work_time = 0;
        }

        self.full_gc_count = info.full_gc_count;
        self.young_gc_count = info.young_gc_count;
        self.new_area_size = info.new_area_size;
        self.old_area_size = info.old_area_size;
        self.metaspace_usage = info.metaspace_usage;
        self.metaspace_capacity = info.metaspace_capacity;
    }

    /// Encode the packed on-disk form in host byte order.
    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut buf = [0u8; HEADER_BYTES];
        buf[0] = self.magic.bits();
        buf[1] = NATIVE_BOM;
        buf[2..10].copy_from_slice(&self.snapshot_time.to_ne_bytes());
        buf[10..18].copy_from_slice(&self.entry_count.to_ne_bytes());
        buf[18..22].copy_from_slice(&(self.cause as u32).to_ne_bytes());
        buf[22..30].copy_from_slice(&self.gc_cause_len.to_ne_bytes());
        buf[30..110].copy_from_slice(&self.gc_cause);
        buf[110..118].copy_from_slice(&self.full_gc_count.to_ne_bytes());
        buf[118..126].copy_from_slice(&self.young_gc_count.to_ne_bytes());
        buf[126..134].copy_from_slice(&self.gc_work_time.to_ne_bytes());
        buf[134..142].copy_from_slice(&self.new_area_size.to_ne_bytes());
        buf[142..150].copy_from_slice(&self.old_area_size.to_ne_bytes());
        buf[150..158].copy_from_slice(&self.total_heap_size.to_ne_bytes());
        buf[158..166].copy_from_slice(&self.metaspace_usage.to_ne_bytes());
        buf[166..174].copy_from_slice(&self.metaspace_capacity.to_ne_bytes());
        buf
    }

    /// Decode a packed header, swapping byte order if the mark says the
    /// writer had the opposite endianness.
    pub fn decode(buf: &[u8]) -> Result<SnapshotHeader, HeaderError> {
        if buf.len() < HEADER_BYTES {
            return Err(HeaderError::Truncated(buf.len()));
        }

        let magic =
            SnapshotFlags::from_bits(buf[0]).ok_or(HeaderError::BadMagic(buf[0]))?;
        if !magic.contains(SnapshotFlags::FORMAT_2_0) {
            return Err(HeaderError::BadMagic(buf[0]));
        }

        let swapped = match buf[1] {
            bom if bom == NATIVE_BOM => false,
            BYTE_ORDER_LITTLE | BYTE_ORDER_BIG => true,
            other => return Err(HeaderError::BadByteOrder(other)),
        };

        let read_i64 = |off: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[off..off + 8]);
            let value = i64::from_ne_bytes(raw);
            if swapped {
                value.swap_bytes()
            } else {
                value
            }
        };
        let read_u32 = |off: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&buf[off..off + 4]);
            let value = u32::from_ne_bytes(raw);
            if swapped {
                value.swap_bytes()
            } else {
                value
            }
        };

        let cause = TriggerCause::try_from(read_u32(18))?;
        let gc_cause_len = read_i64(22);
        if !(1..=GC_CAUSE_BUFFER as i64).contains(&gc_cause_len) {
            return Err(HeaderError::BadCauseLength(gc_cause_len));
        }
        let mut gc_cause = [0u8; GC_CAUSE_BUFFER];
        gc_cause.copy_from_slice(&buf[30..110]);

        Ok(SnapshotHeader {
            magic,
            snapshot_time: read_i64(2),
            entry_count: read_i64(10),
            cause,
            gc_cause_len,
            gc_cause,
            full_gc_count: read_i64(110),
            young_gc_count: read_i64(118),
            gc_work_time: read_i64(126),
            new_area_size: read_i64(134),
            old_area_size: read_i64(142),
            total_heap_size: read_i64(150),
            metaspace_usage: read_i64(158),
            metaspace_capacity: read_i64(166),
        })
    }
}

// =============================================================================
// HeaderError
// =============================================================================

/// Errors from decoding a packed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// The buffer is shorter than a header.
    Truncated(usize),
    /// The magic byte has the format bit clear or reserved bits set.
    BadMagic(u8),
    /// The byte-order mark is neither known sentinel.
    BadByteOrder(u8),
    /// The trigger cause value is unknown.
    BadCause(u32),
    /// The GC cause length is outside `1..=80`.
    BadCauseLength(i64),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::Truncated(len) => {
                write!(f, "header truncated: {} of {} bytes", len, HEADER_BYTES)
            }
            HeaderError::BadMagic(byte) => write!(f, "bad magic byte {:#04x}", byte),
            HeaderError::BadByteOrder(byte) => {
                write!(f, "bad byte-order mark {:#04x}", byte)
            }
            HeaderError::BadCause(raw) => write!(f, "unknown trigger cause {}", raw),
            HeaderError::BadCauseLength(len) => {
                write!(f, "GC cause length {} outside 1..={}", len, GC_CAUSE_BUFFER)
            }
        }
    }
}

impl std::error::Error for HeaderError {}

// =============================================================================
// Tests
// =============================================================================
