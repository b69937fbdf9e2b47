//! Just enough ISO-BMFF parsing for a live origin: the init segment's
//! `mdhd.timescale` and each fragment's `tfdt.baseMediaDecodeTime`.
//! Everything else is carried as opaque bytes.

use std::time::Duration;

use crate::error::{NagareError, NagareResult};

/// Boxes we descend into on the way to `mdhd` and `tfdt`.
const CONTAINERS: &[[u8; 4]] = &[
    *b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"moof", *b"traf",
];

/// Timing extracted from one top-level fragment box.
#[derive(Debug, Clone, Copy)]
pub struct MediaSample {
    /// Decode timestamp of the fragment's first sample.
    pub timestamp: Duration,
}

/// Walk the init segment and return the single `mdhd` timescale.
pub fn parse_timescale(raw: &[u8]) -> NagareResult<u32> {
    let mut timescale: Option<u32> = None;

    walk(raw, &mut |name, body| {
        if name == *b"mdhd" {
            // One track only; a second media header is a broken init segment.
            if timescale.is_some() {
                return Err(NagareError::MultipleMdhd);
            }
            timescale = Some(parse_mdhd(body)?);
        }
        Ok(())
    })?;

    timescale.ok_or(NagareError::MissingTimescale)
}

/// Walk one top-level fragment box. A `moof` opens a sample; a `tfdt` inside
/// it sets the decode timestamp. Boxes without a `moof` carry no timing.
pub fn parse_sample(buf: &[u8], timescale: u32) -> NagareResult<Option<MediaSample>> {
    let mut sample: Option<MediaSample> = None;

    walk(buf, &mut |name, body| {
        match &name {
            b"moof" => {
                sample = Some(MediaSample {
                    timestamp: Duration::ZERO,
                });
            }
            b"tfdt" => {
                if timescale == 0 {
                    return Err(NagareError::MissingTimescale);
                }
                let dts = parse_tfdt(body)?;
                if let Some(sample) = sample.as_mut() {
                    sample.timestamp = ticks_to_duration(dts, timescale);
                }
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok(sample)
}

fn ticks_to_duration(ticks: u64, timescale: u32) -> Duration {
    let nanos = ticks as u128 * 1_000_000_000 / timescale as u128;
    Duration::from_nanos(nanos as u64)
}

fn walk<F>(mut data: &[u8], visit: &mut F) -> NagareResult<()>
where
    F: FnMut([u8; 4], &[u8]) -> NagareResult<()>,
{
    while !data.is_empty() {
        if data.len() < 8 {
            return Err(NagareError::TruncatedBox);
        }

        let size = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
        let name: [u8; 4] = data[4..8].try_into().unwrap();

        if size < 8 {
            return Err(NagareError::BoxTooSmall);
        }
        if size > data.len() {
            return Err(NagareError::TruncatedBox);
        }

        let body = &data[8..size];
        visit(name, body)?;

        if CONTAINERS.contains(&name) {
            walk(body, visit)?;
        }

        data = &data[size..];
    }

    Ok(())
}

fn parse_mdhd(body: &[u8]) -> NagareResult<u32> {
    // version (1) + flags (3), then creation/modification times whose width
    // depends on the version, then the timescale.
    let version = *body.first().ok_or(NagareError::TruncatedBox)?;
    let offset = match version {
        0 => 4 + 4 + 4,
        _ => 4 + 8 + 8,
    };

    let bytes = body
        .get(offset..offset + 4)
        .ok_or(NagareError::TruncatedBox)?;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

fn parse_tfdt(body: &[u8]) -> NagareResult<u64> {
    let version = *body.first().ok_or(NagareError::TruncatedBox)?;
    match version {
        0 => {
            let bytes = body.get(4..8).ok_or(NagareError::TruncatedBox)?;
            Ok(u32::from_be_bytes(bytes.try_into().unwrap()) as u64)
        }
        _ => {
            let bytes = body.get(4..12).ok_or(NagareError::TruncatedBox)?;
            Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
        }
    }
}
