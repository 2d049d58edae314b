use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISCSI};
use flate2::{read::GzDecoder, write::GzEncoder};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Milliseconds since the epoch, as record timestamps expect.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub fn crc32c(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
