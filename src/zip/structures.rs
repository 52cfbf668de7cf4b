use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;

use crate::error::{Error, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionMethod {
    Stored,
    Deflated,
    Unsupported(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflated,
            _ => CompressionMethod::Unsupported(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflated => 8,
            CompressionMethod::Unsupported(v) => *v,
        }
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::DirectoryNotFound);
        }

        let mut cursor = Cursor::new(&data[4..]);
        Ok(Self {
            disk_number: read_u16(&mut cursor)?,
            disk_with_cd: read_u16(&mut cursor)?,
            disk_entries: read_u16(&mut cursor)?,
            total_entries: read_u16(&mut cursor)?,
            cd_size: read_u32(&mut cursor)?,
            cd_offset: read_u32(&mut cursor)?,
            comment_len: read_u16(&mut cursor)?,
        })
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone)]
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::CorruptDirectory(
                "missing ZIP64 end of central directory locator".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);
        Ok(Self {
            disk_with_eocd64: read_u32(&mut cursor)?,
            eocd64_offset: read_u64(&mut cursor)?,
            total_disks: read_u32(&mut cursor)?,
        })
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone)]
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::CorruptDirectory(
                "missing ZIP64 end of central directory record".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);
        Ok(Self {
            eocd64_size: read_u64(&mut cursor)?,
            version_made_by: read_u16(&mut cursor)?,
            version_needed: read_u16(&mut cursor)?,
            disk_number: read_u32(&mut cursor)?,
            disk_with_cd: read_u32(&mut cursor)?,
            disk_entries: read_u64(&mut cursor)?,
            total_entries: read_u64(&mut cursor)?,
            cd_size: read_u64(&mut cursor)?,
            cd_offset: read_u64(&mut cursor)?,
        })
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// General purpose flag: entry is encrypted.
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// General purpose flag: sizes and CRC follow the data in a descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// Fixed part of a local file header plus its name.
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    pub flags: u16,
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    /// Parse the 30 fixed bytes. `data` may be longer.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < LFH_SIZE || &data[0..4] != LFH_SIGNATURE {
            return None;
        }

        let mut cursor = Cursor::new(&data[4..LFH_SIZE]);
        let _version_needed = cursor.read_u16::<LittleEndian>().ok()?;
        let flags = cursor.read_u16::<LittleEndian>().ok()?;
        let compression_method = cursor.read_u16::<LittleEndian>().ok()?;
        let _last_mod_time = cursor.read_u16::<LittleEndian>().ok()?;
        let _last_mod_date = cursor.read_u16::<LittleEndian>().ok()?;
        Some(Self {
            flags,
            compression_method,
            crc32: cursor.read_u32::<LittleEndian>().ok()?,
            compressed_size: cursor.read_u32::<LittleEndian>().ok()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>().ok()?,
            file_name_length: cursor.read_u16::<LittleEndian>().ok()?,
            extra_field_length: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    /// Total header length, i.e. the distance from the signature to the
    /// first payload byte.
    pub fn header_len(&self) -> u64 {
        LFH_SIZE as u64 + self.file_name_length as u64 + self.extra_field_length as u64
    }
}

/// One member of the archive as described by the central directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipEntry {
    /// Archive-relative name.
    pub path: String,
    pub compression_method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    /// Offset of the local header, already corrected for prepended data.
    pub local_header_offset: u64,
    /// Extra field length in the central record; used to guess the local
    /// header length before it has been read.
    pub extra_field_len: u16,
    pub flags: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    /// Compressed bytes already retrieved by an interrupted download.
    #[serde(skip)]
    pub resume_offset: u64,
    /// Decompressed contents, once loaded.
    #[serde(skip)]
    pub data: Option<Arc<[u8]>>,
}

impl ZipEntry {
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Expected length of the local header, assuming it repeats the
    /// central record's name and extra field.
    pub fn header_estimate(&self) -> u64 {
        LFH_SIZE as u64 + self.path.len() as u64 + self.extra_field_len as u64
    }

    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}

/// Parsed central directory of one archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveDirectory {
    /// Entries in central-directory order.
    pub entries: Vec<ZipEntry>,
    /// Length of the remote archive as reported by the server.
    pub archive_length: u64,
    /// Whether the server answered the directory fetch with partial content.
    pub supports_ranges: bool,
}

impl ArchiveDirectory {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&ZipEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ZipEntry> {
        self.entries.iter_mut().find(|e| e.path == path)
    }

    /// `(name, uncompressed size)` pairs in archive order.
    pub fn listing(&self) -> Vec<(&str, u64)> {
        self.entries
            .iter()
            .map(|e| (e.path.as_str(), e.uncompressed_size))
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

fn truncated(err: std::io::Error) -> Error {
    Error::CorruptDirectory(format!("truncated record: {err}"))
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    cursor.read_u16::<LittleEndian>().map_err(truncated)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor.read_u32::<LittleEndian>().map_err(truncated)
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    cursor.read_u64::<LittleEndian>().map_err(truncated)
}
