//! Low-level ZIP structure parsing over byte slices.
//!
//! Nothing here performs I/O. The fetchers hand in whatever bytes they have
//! received and get back either structures or a precise error.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) in the archive's tail
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Parse the Central Directory to get metadata for all files
//! 4. For extraction, validate each file's Local File Header before its data

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};

use super::structures::*;

/// Find the EOCD record in `buf`, which must end at the end of the archive.
///
/// Searches backwards so that a signature embedded in the archive comment
/// is not mistaken for the record. A candidate is accepted only if its
/// comment length reaches exactly to the end of `buf`.
pub fn locate_eocd(buf: &[u8]) -> Option<usize> {
    if buf.len() < EndOfCentralDirectory::SIZE {
        return None;
    }

    for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
        if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
            let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
            if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                return Some(i);
            }
        }
    }

    None
}

/// Parse `expected` consecutive central directory records.
///
/// `bias` is the number of bytes prepended to the archive; it is added to
/// every local header offset. Any bad signature or truncated record fails
/// the whole directory.
pub fn parse_central_directory(data: &[u8], expected: u64, bias: u64) -> Result<Vec<ZipEntry>> {
    let capacity = expected.min((data.len() / CDFH_MIN_SIZE) as u64 + 1) as usize;
    let mut entries = Vec::with_capacity(capacity);
    let mut cursor = Cursor::new(data);

    for index in 0..expected {
        let mut entry = parse_cdfh(&mut cursor, index)?;
        entry.local_header_offset = entry
            .local_header_offset
            .checked_add(bias)
            .ok_or_else(|| Error::CorruptDirectory("local header offset overflows".into()))?;
        entries.push(entry);
    }

    Ok(entries)
}

/// Parse a Central Directory File Header from a cursor.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>, index: u64) -> Result<ZipEntry> {
    let truncated =
        |_: std::io::Error| Error::CorruptDirectory(format!("record {index} is truncated"));

    // Read and verify the signature (PK\x01\x02)
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig).map_err(truncated)?;
    if sig != CDFH_SIGNATURE {
        return Err(Error::CorruptDirectory(format!(
            "record {index} has signature {:02x?}",
            sig
        )));
    }

    let mut fixed = [0u8; CDFH_MIN_SIZE - 4];
    cursor.read_exact(&mut fixed).map_err(truncated)?;
    let mut header = Cursor::new(&fixed[..]);
    let field = |r: std::io::Result<u16>| r.map_err(truncated);

    let _version_made_by = field(header.read_u16::<LittleEndian>())?;
    let _version_needed = field(header.read_u16::<LittleEndian>())?;
    let flags = field(header.read_u16::<LittleEndian>())?;
    let compression_method = field(header.read_u16::<LittleEndian>())?;
    let last_mod_time = field(header.read_u16::<LittleEndian>())?;
    let last_mod_date = field(header.read_u16::<LittleEndian>())?;
    let crc32 = header.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut compressed_size = header.read_u32::<LittleEndian>().map_err(truncated)? as u64;
    let mut uncompressed_size = header.read_u32::<LittleEndian>().map_err(truncated)? as u64;
    let file_name_length = field(header.read_u16::<LittleEndian>())?;
    let extra_field_length = field(header.read_u16::<LittleEndian>())?;
    let file_comment_length = field(header.read_u16::<LittleEndian>())?;
    let _disk_number_start = field(header.read_u16::<LittleEndian>())?;
    let _internal_attrs = field(header.read_u16::<LittleEndian>())?;
    let _external_attrs = header.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut lfh_offset = header.read_u32::<LittleEndian>().map_err(truncated)? as u64;

    let mut file_name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut file_name_bytes).map_err(truncated)?;
    // Use lossy conversion to handle non-UTF8 filenames gracefully
    let path = String::from_utf8_lossy(&file_name_bytes).into_owned();

    let mut extra = vec![0u8; extra_field_length as usize];
    cursor.read_exact(&mut extra).map_err(truncated)?;
    apply_zip64_extra(
        &extra,
        &mut uncompressed_size,
        &mut compressed_size,
        &mut lfh_offset,
    );

    // The file comment is not used.
    let mut comment = vec![0u8; file_comment_length as usize];
    cursor.read_exact(&mut comment).map_err(truncated)?;

    Ok(ZipEntry {
        path,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        local_header_offset: lfh_offset,
        extra_field_len: extra_field_length,
        flags,
        last_mod_time,
        last_mod_date,
        resume_offset: 0,
        data: None,
    })
}

/// ZIP64 extended information (header id 0x0001). Fields are present only
/// when the corresponding 32-bit field is saturated.
fn apply_zip64_extra(
    extra: &[u8],
    uncompressed_size: &mut u64,
    compressed_size: &mut u64,
    lfh_offset: &mut u64,
) {
    let mut cursor = Cursor::new(extra);
    let end = extra.len() as u64;

    while cursor.position() + 4 <= end {
        let (Ok(header_id), Ok(field_size)) = (
            cursor.read_u16::<LittleEndian>(),
            cursor.read_u16::<LittleEndian>(),
        ) else {
            return;
        };
        let field_end = (cursor.position() + field_size as u64).min(end);

        if header_id == 0x0001 {
            for target in [uncompressed_size, compressed_size, lfh_offset] {
                if *target == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                    if let Ok(v) = cursor.read_u64::<LittleEndian>() {
                        *target = v;
                    }
                }
            }
            return;
        }

        cursor.set_position(field_end);
    }
}

/// Validate the local header found at the start of `bytes` against the
/// central directory record of `entry`.
///
/// Returns `Ok(None)` when `bytes` is too short to hold the whole header
/// (name included); the caller should fetch more.
pub fn parse_local_header(entry: &ZipEntry, bytes: &[u8]) -> Result<Option<LocalFileHeader>> {
    if bytes.len() < LFH_SIZE {
        return Ok(None);
    }

    let header = LocalFileHeader::from_bytes(bytes)
        .ok_or_else(|| Error::inconsistent(&entry.path, "no local header signature"))?;

    let name_end = LFH_SIZE + header.file_name_length as usize;
    if bytes.len() < name_end {
        return Ok(None);
    }

    let name = String::from_utf8_lossy(&bytes[LFH_SIZE..name_end]);
    if name != entry.path {
        return Err(Error::inconsistent(
            &entry.path,
            format!("local header names {name:?}"),
        ));
    }

    if header.compression_method != entry.compression_method.as_u16() {
        return Err(Error::inconsistent(
            &entry.path,
            format!(
                "local header uses method {}, central directory says {}",
                header.compression_method,
                entry.compression_method.as_u16()
            ),
        ));
    }

    Ok(Some(header))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cdfh(name: &str, lfh_offset: u32, extra: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(CDFH_SIGNATURE);
        raw.extend_from_slice(&[20, 0, 20, 0]); // versions
        raw.extend_from_slice(&0u16.to_le_bytes()); // flags
        raw.extend_from_slice(&8u16.to_le_bytes()); // method
        raw.extend_from_slice(&[0; 4]); // time, date
        raw.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        raw.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // compressed
        raw.extend_from_slice(&10u32.to_le_bytes()); // uncompressed
        raw.extend_from_slice(&(name.len() as u16).to_le_bytes());
        raw.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes()); // comment
        raw.extend_from_slice(&[0; 8]); // disk, attrs
        raw.extend_from_slice(&lfh_offset.to_le_bytes());
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(extra);
        raw
    }

    #[test]
    fn locate_eocd_honours_comment_length() {
        let mut buf = vec![0xAAu8; 10];
        let start = buf.len();
        buf.extend_from_slice(EndOfCentralDirectory::SIGNATURE);
        buf.extend_from_slice(&[0; 16]);
        buf.extend_from_slice(&4u16.to_le_bytes());
        // Comment holding a fake signature that must be skipped.
        buf.extend_from_slice(b"PK\x05\x06");
        assert_eq!(locate_eocd(&buf), Some(start));
        assert_eq!(locate_eocd(&buf[..start + 10]), None);
    }

    #[test]
    fn parses_records_with_zip64_extra_and_bias() {
        let mut extra = Vec::new();
        extra.extend_from_slice(&0x0001u16.to_le_bytes());
        extra.extend_from_slice(&8u16.to_le_bytes());
        extra.extend_from_slice(&(5_000_000_000u64).to_le_bytes());

        let mut data = cdfh("big.bin", 0, &extra);
        data.extend(cdfh("small.txt", 300, &[]));

        let entries = parse_central_directory(&data, 2, 16).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "big.bin");
        assert_eq!(entries[0].compressed_size, 5_000_000_000);
        assert_eq!(entries[0].compression_method, CompressionMethod::Deflated);
        assert_eq!(entries[0].extra_field_len, 12);
        assert_eq!(entries[0].local_header_offset, 16);
        assert_eq!(entries[1].local_header_offset, 316);
        assert_eq!(entries[1].crc32, 0x1234_5678);
    }

    #[test]
    fn bad_signature_fails_whole_directory() {
        let mut data = cdfh("a.txt", 0, &[]);
        let mut second = cdfh("b.txt", 40, &[]);
        second[0] = b'X';
        data.extend(second);

        let err = parse_central_directory(&data, 2, 0).unwrap_err();
        assert!(matches!(err, Error::CorruptDirectory(_)));
    }

    #[test]
    fn truncated_directory_is_corrupt() {
        let data = cdfh("a.txt", 0, &[]);
        let err = parse_central_directory(&data[..50], 1, 0).unwrap_err();
        assert!(matches!(err, Error::CorruptDirectory(_)));
        let err = parse_central_directory(&data, 2, 0).unwrap_err();
        assert!(matches!(err, Error::CorruptDirectory(_)));
    }
}
