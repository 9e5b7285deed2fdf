//! Pen-data record decoding.
//!
//! The bulk channel carries a stream of records during a fetch (and in
//! live mode): stroke delimiters, absolute points, partial absolute
//! points, and compact delta records. Deltas are two's-complement and
//! apply against the last decoded value of each axis.
//!
//! A stroke delimiter resets the position and pressure context but never
//! the time counter, which accumulates over the whole drawing. A delta
//! arriving before any absolute point in the current stroke is corrupt
//! data and rejected.

use crate::core::protocol::wire::{opcode, RawRecord};
use crate::error::{Result, WacomError};

/// Record type: pen-up followed by pen-down.
pub const STROKE_DELIMITER: u8 = 0xff;
/// Record type: absolute point carrying all four fields.
pub const POINT_ABSOLUTE: u8 = 0xfa;
/// Record type: absolute point carrying a field bitmap.
pub const POINT_PARTIAL: u8 = 0xfb;

// Partial-point bitmap bits.
const PARTIAL_TIME: u8 = 0x01;
const PARTIAL_POSITION: u8 = 0x02;
const PARTIAL_PRESSURE: u8 = 0x04;

// Delta mask bits. Wide selects a 16-bit delta over the default 8-bit.
const DELTA_TIME: u8 = 0x01;
const DELTA_PRESSURE: u8 = 0x02;
const DELTA_PRESSURE_WIDE: u8 = 0x04;
const DELTA_POSITION: u8 = 0x08;
const DELTA_POSITION_WIDE: u8 = 0x10;
const DELTA_TIME_WIDE: u8 = 0x20;
const DELTA_RESERVED: u8 = 0x40;

/// A decoded point. Axes the record did not carry are `None`; the JSON
/// serializer omits them rather than zero-filling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPoint {
    /// Milliseconds since the drawing's base timestamp.
    pub toffset: u32,
    pub position: Option<(i32, i32)>,
    pub pressure: Option<i32>,
}

/// One event decoded from the bulk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PenEvent {
    StrokeStart,
    Point(RawPoint),
    EndOfDrawing,
}

/// Incremental decoder holding the per-axis context between records.
#[derive(Debug, Default)]
pub struct PointDecoder {
    time_ms: u32,
    position: Option<(i32, i32)>,
    pressure: Option<i32>,
    /// True once the current stroke has seen an absolute point.
    has_reference: bool,
}

impl PointDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one record against the running context.
    pub fn decode(&mut self, record: &RawRecord) -> Result<PenEvent> {
        match record.kind {
            STROKE_DELIMITER => {
                if !record.payload.is_empty() {
                    return Err(WacomError::protocol(format!(
                        "stroke delimiter with {} payload bytes",
                        record.payload.len()
                    )));
                }
                // pen-up: only position and pressure context resets
                self.position = None;
                self.pressure = None;
                self.has_reference = false;
                Ok(PenEvent::StrokeStart)
            }
            POINT_ABSOLUTE => self.decode_absolute(record),
            POINT_PARTIAL => self.decode_partial(record),
            opcode::END_OF_DRAWING => {
                if !record.payload.is_empty() {
                    return Err(WacomError::protocol("end-of-drawing with payload"));
                }
                Ok(PenEvent::EndOfDrawing)
            }
            mask if mask & 0x80 == 0 => self.decode_delta(record),
            other => Err(WacomError::protocol(format!(
                "unknown pen record type {other:#04x}"
            ))),
        }
    }

    fn decode_absolute(&mut self, record: &RawRecord) -> Result<PenEvent> {
        let p = &record.payload;
        if p.len() != 8 {
            return Err(WacomError::protocol(format!(
                "absolute point with length {}, expected 8",
                p.len()
            )));
        }
        let toffset = u16::from_le_bytes([p[0], p[1]]) as u32;
        let x = u16::from_le_bytes([p[2], p[3]]) as i32;
        let y = u16::from_le_bytes([p[4], p[5]]) as i32;
        let pressure = u16::from_le_bytes([p[6], p[7]]) as i32;

        self.advance_time_to(toffset)?;
        self.position = Some((x, y));
        self.pressure = Some(pressure);
        self.has_reference = true;

        Ok(PenEvent::Point(RawPoint {
            toffset: self.time_ms,
            position: self.position,
            pressure: self.pressure,
        }))
    }

    fn decode_partial(&mut self, record: &RawRecord) -> Result<PenEvent> {
        let p = &record.payload;
        let bitmap = *p.first().ok_or_else(|| {
            WacomError::protocol("partial point without bitmap byte")
        })?;
        if bitmap & !(PARTIAL_TIME | PARTIAL_POSITION | PARTIAL_PRESSURE) != 0 {
            return Err(WacomError::protocol(format!(
                "partial point with reserved bitmap bits {bitmap:#04x}"
            )));
        }

        let mut expected = 1;
        for (bit, fields) in [
            (PARTIAL_TIME, 1),
            (PARTIAL_POSITION, 2),
            (PARTIAL_PRESSURE, 1),
        ] {
            if bitmap & bit != 0 {
                expected += 2 * fields;
            }
        }
        if p.len() != expected {
            return Err(WacomError::protocol(format!(
                "partial point with length {}, bitmap {bitmap:#04x} expects {expected}",
                p.len()
            )));
        }

        let mut offset = 1;
        let mut next_u16 = || {
            let v = u16::from_le_bytes([p[offset], p[offset + 1]]);
            offset += 2;
            v
        };

        if bitmap & PARTIAL_TIME != 0 {
            let t = next_u16() as u32;
            self.advance_time_to(t)?;
        }
        let position = (bitmap & PARTIAL_POSITION != 0)
            .then(|| (next_u16() as i32, next_u16() as i32));
        let pressure = (bitmap & PARTIAL_PRESSURE != 0).then(|| next_u16() as i32);

        if let Some(pos) = position {
            self.position = Some(pos);
        }
        if let Some(pres) = pressure {
            self.pressure = Some(pres);
        }
        self.has_reference = true;

        Ok(PenEvent::Point(RawPoint {
            toffset: self.time_ms,
            position,
            pressure,
        }))
    }

    fn decode_delta(&mut self, record: &RawRecord) -> Result<PenEvent> {
        let mask = record.kind;
        if mask & DELTA_RESERVED != 0 {
            return Err(WacomError::protocol(format!(
                "delta record with reserved mask bit {mask:#04x}"
            )));
        }
        if !self.has_reference {
            return Err(WacomError::protocol(
                "delta record before any absolute point in stroke",
            ));
        }

        let p = &record.payload;
        let mut offset = 0;
        let mut next_delta = |wide: bool| -> Result<i32> {
            let width = if wide { 2 } else { 1 };
            if offset + width > p.len() {
                return Err(WacomError::protocol(format!(
                    "delta record {mask:#04x} truncated at byte {offset}"
                )));
            }
            let v = if wide {
                i16::from_le_bytes([p[offset], p[offset + 1]]) as i32
            } else {
                p[offset] as i8 as i32
            };
            offset += width;
            Ok(v)
        };

        let dt = (mask & DELTA_TIME != 0)
            .then(|| next_delta(mask & DELTA_TIME_WIDE != 0))
            .transpose()?;
        let dpos = if mask & DELTA_POSITION != 0 {
            let wide = mask & DELTA_POSITION_WIDE != 0;
            Some((next_delta(wide)?, next_delta(wide)?))
        } else {
            None
        };
        let dp = (mask & DELTA_PRESSURE != 0)
            .then(|| next_delta(mask & DELTA_PRESSURE_WIDE != 0))
            .transpose()?;

        if offset != p.len() {
            return Err(WacomError::protocol(format!(
                "delta record {mask:#04x} with {} trailing bytes",
                p.len() - offset
            )));
        }

        if let Some(dt) = dt {
            let t = self.time_ms as i64 + dt as i64;
            if t < self.time_ms as i64 || t > u32::MAX as i64 {
                return Err(WacomError::protocol(format!(
                    "time offset moved backwards by {dt} ms"
                )));
            }
            self.time_ms = t as u32;
        }

        let position = match dpos {
            Some((dx, dy)) => {
                let (x, y) = self.position.ok_or_else(|| {
                    WacomError::protocol("position delta without position reference")
                })?;
                let pos = (x + dx, y + dy);
                self.position = Some(pos);
                Some(pos)
            }
            None => None,
        };
        let pressure = match dp {
            Some(dp) => {
                let pres = self.pressure.ok_or_else(|| {
                    WacomError::protocol("pressure delta without pressure reference")
                })?;
                let pres = pres + dp;
                self.pressure = Some(pres);
                Some(pres)
            }
            None => None,
        };

        Ok(PenEvent::Point(RawPoint {
            toffset: self.time_ms,
            position,
            pressure,
        }))
    }

    fn advance_time_to(&mut self, toffset: u32) -> Result<()> {
        if toffset < self.time_ms {
            return Err(WacomError::protocol(format!(
                "time offset {toffset} before current {}",
                self.time_ms
            )));
        }
        self.time_ms = toffset;
        Ok(())
    }
}
