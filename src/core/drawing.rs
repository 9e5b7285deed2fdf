//! The normalized drawing model and its JSON file format (version 1).
//!
//! A Drawing is a completed capture: ordered Strokes of Points, the device
//! dimensions, and the base timestamp taken from the device clock. Point
//! axes the decoder did not see are omitted from the JSON rather than
//! zero-filled; consumers ignore fields they do not know.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WacomError};

/// Version written into and required from the JSON file format.
pub const JSON_FILE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    /// Milliseconds since the drawing's base timestamp.
    pub toffset: u32,
    /// Position in µm, origin at the sensor's top-left.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub position: Option<(u32, u32)>,
    /// Stylus pressure, 0..=65535.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pressure: Option<u32>,
}

/// A maximal sequence of points between pen-down and pen-up. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drawing {
    version: u32,
    pub devicename: String,
    /// Opaque per-fetch identifier, for debugging only.
    pub sessionid: String,
    /// (width, height) in µm as reported by the device.
    pub dimensions: (u32, u32),
    /// Seconds since the epoch, device clock at session start. Unique per
    /// device within a daemon run.
    pub timestamp: u64,
    pub strokes: Vec<Stroke>,
}

impl Drawing {
    pub fn new(
        devicename: impl Into<String>,
        sessionid: impl Into<String>,
        dimensions: (u32, u32),
        timestamp: u64,
        strokes: Vec<Stroke>,
    ) -> Self {
        Drawing {
            version: JSON_FILE_FORMAT_VERSION,
            devicename: devicename.into(),
            sessionid: sessionid.into(),
            dimensions,
            timestamp,
            strokes,
        }
    }

    /// Serialize to the version 1 JSON file format.
    pub fn to_json(&self) -> String {
        // the model is plain data, serialization cannot fail
        serde_json::to_string(self).expect("drawing serialization")
    }

    pub fn from_json(json: &str) -> Result<Drawing> {
        let d: Drawing = serde_json::from_str(json)
            .map_err(|e| WacomError::protocol(format!("invalid drawing JSON: {e}")))?;
        if d.version != JSON_FILE_FORMAT_VERSION {
            return Err(WacomError::InvalidArgument("unsupported file format version"));
        }
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Drawing {
        Drawing::new(
            "Bamboo Slate",
            "b3c8e7aa",
            (21600, 14800),
            1549195225,
            vec![
                Stroke {
                    points: vec![
                        Point {
                            toffset: 0,
                            position: Some((100, 200)),
                            pressure: Some(1000),
                        },
                        Point {
                            toffset: 2,
                            position: None,
                            pressure: Some(800),
                        },
                    ],
                },
                Stroke {
                    points: vec![Point {
                        toffset: 40,
                        position: Some((5000, 6000)),
                        pressure: None,
                    }],
                },
            ],
        )
    }

    #[test]
    fn test_json_roundtrip() {
        let d = sample();
        let parsed = Drawing::from_json(&d.to_json()).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let json = sample().to_json();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();

        let first = &v["strokes"][0]["points"][0];
        assert_eq!(first["position"], serde_json::json!([100, 200]));
        assert_eq!(first["pressure"], serde_json::json!(1000));

        // the inherited-position point must not carry the key at all
        let second = &v["strokes"][0]["points"][1];
        assert!(second.get("position").is_none());
        assert_eq!(second["toffset"], serde_json::json!(2));

        let third = &v["strokes"][1]["points"][0];
        assert!(third.get("pressure").is_none());
    }

    #[test]
    fn test_top_level_shape() {
        let v: serde_json::Value = serde_json::from_str(&sample().to_json()).unwrap();
        assert_eq!(v["version"], serde_json::json!(1));
        assert_eq!(v["devicename"], serde_json::json!("Bamboo Slate"));
        assert_eq!(v["sessionid"], serde_json::json!("b3c8e7aa"));
        assert_eq!(v["dimensions"], serde_json::json!([21600, 14800]));
        assert_eq!(v["timestamp"], serde_json::json!(1549195225u64));
    }

    #[test]
    fn test_unknown_point_fields_ignored() {
        let json = r#"{
            "version": 1, "devicename": "d", "sessionid": "s",
            "dimensions": [100, 100], "timestamp": 1,
            "strokes": [{"points": [{"toffset": 0, "pressure": 5, "tilt": 12}]}]
        }"#;
        let d = Drawing::from_json(json).unwrap();
        assert_eq!(d.strokes[0].points[0].pressure, Some(5));
        assert_eq!(d.strokes[0].points[0].position, None);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let json = r#"{
            "version": 2, "devicename": "d", "sessionid": "s",
            "dimensions": [100, 100], "timestamp": 1, "strokes": []
        }"#;
        assert!(matches!(
            Drawing::from_json(json),
            Err(WacomError::InvalidArgument(_))
        ));
    }
}
