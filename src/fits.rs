//! Minimal FITS-like frame writer (spec.md §6 "Persisted artifacts").
//!
//! Full FITS I/O format compliance is explicitly out of scope
//! (spec.md §1); this writes a single 2-D image HDU with the keywords
//! named in spec.md §6, enough for round-tripping with the store-N
//! test tooling and any downstream FITS reader.

use std::io::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::AoResult;
use crate::frame::{Depth, Frame};

const BLOCK: usize = 2880;
const CARD: usize = 80;

#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    pub devname: String,
    pub devtype: String,
    pub exptime: f64,
    pub interval: f64,
    pub gain: f64,
    pub offset: f64,
    pub observer: String,
    pub target: String,
    pub comment: String,
    pub timestamp: DateTime<Utc>,
}

fn card(keyword: &str, value: impl std::fmt::Display) -> String {
    let mut s = format!("{:<8}= {:<20}", keyword, format!("{}", value));
    s.truncate(CARD);
    format!("{:<80}", s)
}

fn string_card(keyword: &str, value: &str) -> String {
    let quoted = format!("'{}'", value);
    card(keyword, quoted)
}

fn bitpix_for(depth: Depth) -> i32 {
    match depth {
        Depth::U8 => 8,
        Depth::U16 => 16,
        Depth::U32 => 32,
    }
}

pub fn write_fits<P: AsRef<Path>>(path: P, frame: &Frame, header: &FitsHeader) -> AoResult<()> {
    let mut f = frame.clone();
    let stats = f.stats();
    let mut cards = Vec::new();
    cards.push(card("SIMPLE", "T"));
    cards.push(card("BITPIX", bitpix_for(frame.depth)));
    cards.push(card("NAXIS", 2));
    cards.push(card("NAXIS1", frame.width));
    cards.push(card("NAXIS2", frame.height));
    cards.push(card("MAXVAL", stats.max));
    cards.push(card("MINVAL", stats.min));
    cards.push(card("AVG", stats.mean));
    cards.push(card("RMS", stats.rms));
    cards.push(string_card("DEVNAME", &header.devname));
    cards.push(string_card("DEVTYPE", &header.devtype));
    cards.push(string_card("TELESCOPE", "simulator"));
    cards.push(string_card("INSTRUMENT", &header.devname));
    cards.push(string_card("OBSERVER", &header.observer));
    cards.push(string_card("TARGET", &header.target));
    cards.push(card("EXPTIME", header.exptime));
    cards.push(card("INTERVAL", header.interval));
    cards.push(card("GAIN", header.gain));
    cards.push(card("OFFSET", header.offset));
    cards.push(string_card("COMMENT", &header.comment));
    cards.push(string_card("DATE-OBS", &header.timestamp.to_rfc3339()));
    cards.push(format!("{:<80}", "END"));

    let mut out = std::fs::File::create(path)?;
    let mut header_bytes = Vec::new();
    for c in &cards {
        header_bytes.extend_from_slice(c.as_bytes());
    }
    pad_to_block(&mut header_bytes);
    out.write_all(&header_bytes)?;

    let mut data = frame.data.clone();
    if frame.depth != Depth::U8 {
        // FITS integer data is big-endian; the frame's backing store
        // is little-endian (spec.md §6 "little-endian for 16-bit
        // depth" describes the network wire format, not storage).
        let word = frame.depth.bytes_per_pixel();
        for chunk in data.chunks_mut(word) {
            chunk.reverse();
        }
    }
    pad_to_block(&mut data);
    out.write_all(&data)?;
    Ok(())
}

fn pad_to_block(buf: &mut Vec<u8>) {
    let rem = buf.len() % BLOCK;
    if rem != 0 {
        buf.extend(std::iter::repeat(0u8).take(BLOCK - rem));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_block_aligned_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.fits");
        let frame = Frame::new(0, 4, 4, Depth::U8, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let header = FitsHeader {
            devname: "cam0".into(),
            devtype: "camera".into(),
            exptime: 0.01,
            ..Default::default()
        };
        write_fits(&path, &frame, &header).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len % BLOCK as u64, 0);
    }
}
