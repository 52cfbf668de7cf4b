//! Shared test utilities for integration tests.
//!
//! `ZipBuilder` writes small archives byte by byte so tests control every
//! field, and the source wrappers inject failures or hold requests back.
//!
//! Note: `#![allow(dead_code)]` is required because each integration test file
//! compiles as a separate crate and may only use a subset of these helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;

use remotezip::{ByteRange, Error, MemorySource, RangeResponse, RangeSource, Result};

pub const URL: &str = "https://example.test/archive.zip";

/// 1980-01-01 00:00, the DOS epoch.
const DOS_DATE: u16 = (1 << 5) | 1;

pub struct Member {
    pub name: String,
    pub data: Vec<u8>,
    pub method: u16,
    pub flags: u16,
    /// Name written into the local header, when it should differ.
    pub local_name: Option<String>,
    /// Extra field written into the local header only.
    pub local_extra: Vec<u8>,
    /// Extra field written into the central record only.
    pub central_extra: Vec<u8>,
    /// CRC-32 recorded in the central directory, when it should be wrong.
    pub central_crc: Option<u32>,
    /// Local header offset recorded in the central directory, when it
    /// should be wrong.
    pub central_offset: Option<u32>,
}

impl Member {
    pub fn stored(name: &str, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            data: data.to_vec(),
            method: 0,
            flags: 0,
            local_name: None,
            local_extra: Vec::new(),
            central_extra: Vec::new(),
            central_crc: None,
            central_offset: None,
        }
    }

    pub fn deflated(name: &str, data: &[u8]) -> Self {
        Self {
            method: 8,
            ..Self::stored(name, data)
        }
    }

    fn payload(&self) -> Vec<u8> {
        if self.method == 8 {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&self.data).unwrap();
            enc.finish().unwrap()
        } else {
            self.data.clone()
        }
    }
}

#[derive(Default)]
pub struct ZipBuilder {
    prefix: Vec<u8>,
    members: Vec<Member>,
    comment: Vec<u8>,
    zip64: bool,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.member(Member::stored(name, data))
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        self.member(Member::deflated(name, data))
    }

    pub fn member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Bytes placed before the archive, with offsets left unadjusted.
    pub fn prefix(mut self, prefix: &[u8]) -> Self {
        self.prefix = prefix.to_vec();
        self
    }

    /// Write ZIP64 end records and saturate the classic EOCD.
    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut zip = Vec::new();
        let mut central = Vec::new();

        for m in &self.members {
            let offset = zip.len() as u32;
            let payload = m.payload();
            let crc = crc32fast::hash(&m.data);
            let local_name = m.local_name.as_deref().unwrap_or(&m.name);

            zip.write_all(b"PK\x03\x04").unwrap();
            zip.write_u16::<LittleEndian>(20).unwrap();
            zip.write_u16::<LittleEndian>(m.flags).unwrap();
            zip.write_u16::<LittleEndian>(m.method).unwrap();
            zip.write_u16::<LittleEndian>(0).unwrap();
            zip.write_u16::<LittleEndian>(DOS_DATE).unwrap();
            zip.write_u32::<LittleEndian>(crc).unwrap();
            zip.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
            zip.write_u32::<LittleEndian>(m.data.len() as u32).unwrap();
            zip.write_u16::<LittleEndian>(local_name.len() as u16).unwrap();
            zip.write_u16::<LittleEndian>(m.local_extra.len() as u16).unwrap();
            zip.write_all(local_name.as_bytes()).unwrap();
            zip.write_all(&m.local_extra).unwrap();
            zip.write_all(&payload).unwrap();

            central.write_all(b"PK\x01\x02").unwrap();
            central.write_u16::<LittleEndian>(20).unwrap();
            central.write_u16::<LittleEndian>(20).unwrap();
            central.write_u16::<LittleEndian>(m.flags).unwrap();
            central.write_u16::<LittleEndian>(m.method).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(DOS_DATE).unwrap();
            central
                .write_u32::<LittleEndian>(m.central_crc.unwrap_or(crc))
                .unwrap();
            central.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
            central.write_u32::<LittleEndian>(m.data.len() as u32).unwrap();
            central.write_u16::<LittleEndian>(m.name.len() as u16).unwrap();
            central.write_u16::<LittleEndian>(m.central_extra.len() as u16).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(0).unwrap();
            central
                .write_u32::<LittleEndian>(m.central_offset.unwrap_or(offset))
                .unwrap();
            central.write_all(m.name.as_bytes()).unwrap();
            central.write_all(&m.central_extra).unwrap();
        }

        let cd_offset = zip.len() as u64;
        let cd_size = central.len() as u64;
        let count = self.members.len() as u64;
        zip.extend_from_slice(&central);

        if self.zip64 {
            let record_offset = zip.len() as u64;
            zip.write_all(b"PK\x06\x06").unwrap();
            zip.write_u64::<LittleEndian>(44).unwrap();
            zip.write_u16::<LittleEndian>(45).unwrap();
            zip.write_u16::<LittleEndian>(45).unwrap();
            zip.write_u32::<LittleEndian>(0).unwrap();
            zip.write_u32::<LittleEndian>(0).unwrap();
            zip.write_u64::<LittleEndian>(count).unwrap();
            zip.write_u64::<LittleEndian>(count).unwrap();
            zip.write_u64::<LittleEndian>(cd_size).unwrap();
            zip.write_u64::<LittleEndian>(cd_offset).unwrap();

            zip.write_all(b"PK\x06\x07").unwrap();
            zip.write_u32::<LittleEndian>(0).unwrap();
            zip.write_u64::<LittleEndian>(record_offset).unwrap();
            zip.write_u32::<LittleEndian>(1).unwrap();
        }

        let (count16, size32, offset32) = if self.zip64 {
            (0xFFFF, 0xFFFF_FFFF, 0xFFFF_FFFF)
        } else {
            (count as u16, cd_size as u32, cd_offset as u32)
        };
        zip.write_all(b"PK\x05\x06").unwrap();
        zip.write_u16::<LittleEndian>(0).unwrap();
        zip.write_u16::<LittleEndian>(0).unwrap();
        zip.write_u16::<LittleEndian>(count16).unwrap();
        zip.write_u16::<LittleEndian>(count16).unwrap();
        zip.write_u32::<LittleEndian>(size32).unwrap();
        zip.write_u32::<LittleEndian>(offset32).unwrap();
        zip.write_u16::<LittleEndian>(self.comment.len() as u16).unwrap();
        zip.write_all(&self.comment).unwrap();

        let mut out = self.prefix.clone();
        out.extend_from_slice(&zip);
        out
    }
}

/// ZIP64 extended information field carrying only a local header offset.
pub fn zip64_offset_extra(offset: u64) -> Vec<u8> {
    let mut extra = Vec::new();
    extra.write_u16::<LittleEndian>(0x0001).unwrap();
    extra.write_u16::<LittleEndian>(8).unwrap();
    extra.write_u64::<LittleEndian>(offset).unwrap();
    extra
}

/// An extra field with an id nothing interprets.
pub fn opaque_extra(len: u16) -> Vec<u8> {
    let mut extra = Vec::new();
    extra.write_u16::<LittleEndian>(0xCAFE).unwrap();
    extra.write_u16::<LittleEndian>(len).unwrap();
    extra.extend(std::iter::repeat_n(0xAB, len as usize));
    extra
}

/// Deterministic, poorly compressible filler.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Fails the requests whose 1-based sequence numbers are listed.
pub struct FlakySource {
    pub inner: MemorySource,
    fail: Mutex<HashSet<usize>>,
    calls: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: MemorySource, fail: &[usize]) -> Self {
        Self {
            inner,
            fail: Mutex::new(fail.iter().copied().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RangeSource for FlakySource {
    async fn fetch(&self, range: ByteRange) -> Result<RangeResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.lock().unwrap().remove(&n) {
            return Err(Error::Network(format!("injected failure on request {n}")));
        }
        self.inner.fetch(range).await
    }

    async fn fetch_all(&self) -> Result<Vec<u8>> {
        self.inner.fetch_all().await
    }

    fn describe(&self) -> String {
        "flaky".into()
    }
}

/// Holds every request until a permit is released for it.
pub struct GateSource {
    pub inner: MemorySource,
    gate: Semaphore,
    waiting: AtomicUsize,
}

impl GateSource {
    pub fn new(inner: MemorySource) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Let `n` more requests through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait until `n` requests are parked at the gate.
    pub async fn wait_for_waiting(&self, n: usize) {
        while self.waiting() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Decrements the waiting count even when the request is dropped.
struct Parked<'a>(&'a AtomicUsize);

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RangeSource for GateSource {
    async fn fetch(&self, range: ByteRange) -> Result<RangeResponse> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let parked = Parked(&self.waiting);
        self.gate
            .acquire()
            .await
            .map_err(|e| Error::Network(e.to_string()))?
            .forget();
        drop(parked);
        self.inner.fetch(range).await
    }

    async fn fetch_all(&self) -> Result<Vec<u8>> {
        self.inner.fetch_all().await
    }

    fn describe(&self) -> String {
        "gated".into()
    }
}
