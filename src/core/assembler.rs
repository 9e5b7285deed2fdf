//! Assembles decoded pen events into a normalized [`Drawing`].
//!
//! Normalization covers the sensor rotation of the Spark/Slate families,
//! pressure clamping, and dropping empty strokes. Timestamp uniqueness is
//! enforced later by the device record, which knows all prior drawings.

use log::debug;
use uuid::Uuid;

use crate::core::drawing::{Drawing, Point, Stroke};
use crate::core::protocol::pen::{PenEvent, RawPoint};
use crate::core::protocol::ProtocolFamily;
use crate::error::{Result, WacomError};

pub struct DrawingAssembler {
    family: ProtocolFamily,
    devicename: String,
    sessionid: String,
    dimensions: (u32, u32),
    timestamp: u64,
    strokes: Vec<Stroke>,
    current: Vec<Point>,
}

impl DrawingAssembler {
    /// Start assembling a drawing whose base timestamp is the device clock
    /// at session start.
    pub fn new(
        family: ProtocolFamily,
        devicename: impl Into<String>,
        dimensions: (u32, u32),
        timestamp: u64,
    ) -> Self {
        DrawingAssembler {
            family,
            devicename: devicename.into(),
            sessionid: Uuid::new_v4().simple().to_string(),
            dimensions,
            timestamp,
            strokes: Vec::new(),
            current: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.sessionid
    }

    /// Feed one decoded event. Returns the finished drawing on
    /// [`PenEvent::EndOfDrawing`].
    pub fn push(&mut self, event: PenEvent) -> Result<Option<Drawing>> {
        match event {
            PenEvent::StrokeStart => {
                self.seal_stroke();
                Ok(None)
            }
            PenEvent::Point(raw) => {
                let point = self.normalize(raw)?;
                self.current.push(point);
                Ok(None)
            }
            PenEvent::EndOfDrawing => {
                self.seal_stroke();
                debug!(
                    "{}: drawing at {} with {} strokes complete",
                    self.devicename,
                    self.timestamp,
                    self.strokes.len()
                );
                Ok(Some(Drawing::new(
                    std::mem::take(&mut self.devicename),
                    std::mem::take(&mut self.sessionid),
                    self.dimensions,
                    self.timestamp,
                    std::mem::take(&mut self.strokes),
                )))
            }
        }
    }

    fn seal_stroke(&mut self) {
        // strokes are never empty; a delimiter with nothing buffered is a
        // pen-down that produced no points
        if !self.current.is_empty() {
            self.strokes.push(Stroke {
                points: std::mem::take(&mut self.current),
            });
        }
    }

    fn normalize(&self, raw: RawPoint) -> Result<Point> {
        let position = match raw.position {
            Some((x, y)) => Some(self.rotate(x, y)?),
            None => None,
        };
        let pressure = raw.pressure.map(|p| p.clamp(0, u16::MAX as i32) as u32);
        Ok(Point {
            toffset: raw.toffset,
            position,
            pressure,
        })
    }

    /// Spark/Slate sensors are rotated 90° CW; map to a top-left origin
    /// with `(x, y) := (y, width - x)`, `width` being the reported long
    /// edge.
    fn rotate(&self, x: i32, y: i32) -> Result<(u32, u32)> {
        let (x, y) = if self.family.rotated() {
            let width = self.dimensions.0 as i32;
            (y, width - x)
        } else {
            (x, y)
        };
        if x < 0 || y < 0 {
            return Err(WacomError::protocol(format!(
                "point ({x}, {y}) outside the sensor"
            )));
        }
        Ok((x as u32, y as u32))
    }
}

/// Bump `timestamp` until it is not in `used`, one second at a time.
///
/// Within one device and one daemon run no two drawings may share a
/// timestamp; ties are broken by arrival order, the later drawing moving
/// forward.
pub fn unique_timestamp(timestamp: u64, used: &[u64]) -> u64 {
    let mut t = timestamp;
    while used.contains(&t) {
        t += 1;
    }
    t
}
