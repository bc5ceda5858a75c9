use common::{DbError, DbResult};

/// The header string at byte 0 of every database file.
pub const MAGIC: [u8; 16] = *b"Tusk format 1\0\0\0";

/// The header occupies the first 100 bytes of page 0.
pub const HEADER_SIZE: usize = 100;

/// Newest on-disk format this build can read.
pub const SUPPORTED_FORMAT_VERSION: u8 = 1;

/// Engine version stamped at offset 96: major * 1_000_000 + minor * 1_000
/// + patch.
pub const ENGINE_VERSION: u32 = 1_000;

pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65536;

/// In-memory form of the 100-byte file header.
///
/// All multi-byte fields are stored little-endian. The magic and the page
/// size are immutable once the file exists; everything else is rewritten
/// whenever the pager syncs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_per_page: u8,
    pub max_payload_fraction: u8,
    pub min_payload_fraction: u8,
    pub leaf_payload_fraction: u8,
    pub change_counter: u32,
    pub page_count: u32,
    pub freelist_head: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_version: u32,
    pub default_cache_size: u32,
    pub largest_root_page: u32,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub engine_version: u32,
}

impl DbHeader {
    /// Header for a freshly created single-page database.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            write_version: 1,
            read_version: 1,
            reserved_per_page: 0,
            max_payload_fraction: 64,
            min_payload_fraction: 32,
            leaf_payload_fraction: 32,
            change_counter: 1,
            page_count: 1,
            freelist_head: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_version: 1,
            default_cache_size: 0,
            largest_root_page: 0,
            text_encoding: 1,
            user_version: 0,
            incremental_vacuum: 0,
            application_id: 0,
            version_valid_for: 1,
            engine_version: ENGINE_VERSION,
        }
    }

    /// Serializes into the 100-byte on-disk form. Bytes 72..92 are
    /// reserved and always written as zero.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..16].copy_from_slice(&MAGIC);
        // 65536 does not fit in two bytes; the stored value 1 encodes it.
        let stored_page_size: u16 = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        out[16..18].copy_from_slice(&stored_page_size.to_le_bytes());
        out[18] = self.write_version;
        out[19] = self.read_version;
        out[20] = self.reserved_per_page;
        out[21] = self.max_payload_fraction;
        out[22] = self.min_payload_fraction;
        out[23] = self.leaf_payload_fraction;
        out[24..28].copy_from_slice(&self.change_counter.to_le_bytes());
        out[28..32].copy_from_slice(&self.page_count.to_le_bytes());
        out[32..36].copy_from_slice(&self.freelist_head.to_le_bytes());
        out[36..40].copy_from_slice(&self.freelist_count.to_le_bytes());
        out[40..44].copy_from_slice(&self.schema_cookie.to_le_bytes());
        out[44..48].copy_from_slice(&self.schema_version.to_le_bytes());
        out[48..52].copy_from_slice(&self.default_cache_size.to_le_bytes());
        out[52..56].copy_from_slice(&self.largest_root_page.to_le_bytes());
        out[56..60].copy_from_slice(&self.text_encoding.to_le_bytes());
        out[60..64].copy_from_slice(&self.user_version.to_le_bytes());
        out[64..68].copy_from_slice(&self.incremental_vacuum.to_le_bytes());
        out[68..72].copy_from_slice(&self.application_id.to_le_bytes());
        // 72..92 reserved.
        out[92..96].copy_from_slice(&self.version_valid_for.to_le_bytes());
        out[96..100].copy_from_slice(&self.engine_version.to_le_bytes());
        out
    }

    /// Deserializes the on-disk form. Checks only what decoding needs;
    /// call [`validate`](Self::validate) for the field constraints.
    pub fn decode(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DbError::HeaderTooShort(bytes.len()));
        }
        if bytes[0..16] != MAGIC {
            return Err(DbError::InvalidMagic);
        }

        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let stored_page_size = u16::from_le_bytes(bytes[16..18].try_into().unwrap());
        let page_size = if stored_page_size == 1 {
            65536
        } else {
            stored_page_size as u32
        };

        Ok(Self {
            page_size,
            write_version: bytes[18],
            read_version: bytes[19],
            reserved_per_page: bytes[20],
            max_payload_fraction: bytes[21],
            min_payload_fraction: bytes[22],
            leaf_payload_fraction: bytes[23],
            change_counter: u32_at(24),
            page_count: u32_at(28),
            freelist_head: u32_at(32),
            freelist_count: u32_at(36),
            schema_cookie: u32_at(40),
            schema_version: u32_at(44),
            default_cache_size: u32_at(48),
            largest_root_page: u32_at(52),
            text_encoding: u32_at(56),
            user_version: u32_at(60),
            incremental_vacuum: u32_at(64),
            application_id: u32_at(68),
            version_valid_for: u32_at(92),
            engine_version: u32_at(96),
        })
    }

    /// Enforces the field constraints an openable database must satisfy.
    pub fn validate(&self) -> DbResult<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(DbError::InvalidPageSize(self.page_size));
        }
        if self.write_version == 0 {
            return Err(DbError::InvalidFormatVersion(self.write_version));
        }
        if self.read_version == 0 {
            return Err(DbError::InvalidFormatVersion(self.read_version));
        }
        if self.read_version > SUPPORTED_FORMAT_VERSION {
            return Err(DbError::UnsupportedVersion(
                self.read_version,
                SUPPORTED_FORMAT_VERSION,
            ));
        }
        if u32::from(self.reserved_per_page) > self.page_size / 2 {
            return Err(DbError::Storage(format!(
                "{} reserved bytes per page exceed half the page size",
                self.reserved_per_page
            )));
        }
        if self.page_count == 0 {
            return Err(DbError::InvalidPageCount(self.page_count));
        }
        Ok(())
    }
}
