//! Virtual pen device for live mode.
//!
//! Live mode writes kernel UHID frames to a file descriptor the client
//! supplies (usually an open `/dev/uhid`). The frames are plain little-
//! endian structs: `UHID_CREATE2` announces a HID device described by a
//! digitizer report descriptor, `UHID_INPUT2` injects one report,
//! `UHID_DESTROY` removes the device again.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{FromRawFd, RawFd};

use log::debug;
use uuid::Uuid;

use crate::core::protocol::pen::RawPoint;

const UHID_DESTROY: u32 = 1;
const UHID_CREATE2: u32 = 11;
const UHID_INPUT2: u32 = 12;

const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

/// Where live-mode pen events go. The UHID device is the production sink;
/// tests record the stream instead.
pub trait PenEventSink: Send {
    fn point(&mut self, point: &RawPoint) -> io::Result<()>;
    /// The pen left proximity (stroke delimiter in the live stream).
    fn pen_up(&mut self) -> io::Result<()>;
}

/// The stylus digitizer report descriptor, with the axis ranges patched
/// in per device. Report layout: `[id=1][in-range bit][x:u16][y:u16]
/// [pressure:u16]`.
pub fn pen_report_descriptor(width: u32, height: u32, pressure_max: u16) -> Vec<u8> {
    let le = |v: u32| v.to_le_bytes();
    let mut rdesc = vec![
        0x05, 0x0d, // Usage Page (Digitizers)
        0x09, 0x01, // Usage (Digitizer)
        0xa1, 0x01, // Collection (Application)
        0x85, 0x01, // .Report ID (1)
        0x09, 0x20, // .Usage (Stylus)
        0xa1, 0x00, // .Collection (Physical)
        0x09, 0x32, // ..Usage (In Range)
        0x15, 0x00, // ..Logical Minimum (0)
        0x25, 0x01, // ..Logical Maximum (1)
        0x95, 0x01, // ..Report Count (1)
        0x75, 0x01, // ..Report Size (1)
        0x81, 0x02, // ..Input (Data,Var,Abs)
        0x95, 0x07, // ..Report Count (7)
        0x81, 0x03, // ..Input (Cnst,Var,Abs)
        0x05, 0x01, // ..Usage Page (Generic Desktop)
        0x09, 0x30, // ..Usage (X)
        0x75, 0x10, // ..Report Size (16)
        0x95, 0x01, // ..Report Count (1)
        0x55, 0x0d, // ..Unit Exponent (-3)
        0x65, 0x11, // ..Unit (Centimeter, SI Linear)
    ];
    rdesc.push(0x37); // ..Physical Minimum
    rdesc.extend(le(0));
    rdesc.push(0x47); // ..Physical Maximum
    rdesc.extend(le(width));
    rdesc.push(0x17); // ..Logical Minimum
    rdesc.extend(le(0));
    rdesc.push(0x27); // ..Logical Maximum
    rdesc.extend(le(width));
    rdesc.extend([0x81, 0x02]); // ..Input (Data,Var,Abs)
    rdesc.extend([0x09, 0x31]); // ..Usage (Y)
    rdesc.push(0x37);
    rdesc.extend(le(0));
    rdesc.push(0x47);
    rdesc.extend(le(height));
    rdesc.push(0x17);
    rdesc.extend(le(0));
    rdesc.push(0x27);
    rdesc.extend(le(height));
    rdesc.extend([0x81, 0x02]); // ..Input (Data,Var,Abs)
    rdesc.extend([0x05, 0x0d]); // ..Usage Page (Digitizers)
    rdesc.extend([0x15, 0x00]); // ..Logical Minimum (0)
    rdesc.extend([0x09, 0x30]); // ..Usage (Tip Pressure)
    rdesc.push(0x27); // ..Logical Maximum
    rdesc.extend(le(pressure_max as u32));
    rdesc.extend([0x81, 0x02]); // ..Input (Data,Var,Abs)
    rdesc.push(0xc0); // .End Collection
    rdesc.push(0xc0); // End Collection
    rdesc
}

fn fixed_str(buf: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1); // keep NUL termination
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(buf.len() + (len - n), 0);
}

/// Encode a `UHID_CREATE2` frame.
pub fn create2_frame(name: &str, uniq: &str, rdesc: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 128 + 64 + 64 + 2 + 2 + 4 * 4 + HID_MAX_DESCRIPTOR_SIZE);
    buf.extend(UHID_CREATE2.to_le_bytes());
    fixed_str(&mut buf, name, 128);
    fixed_str(&mut buf, "", 64); // phys
    fixed_str(&mut buf, uniq, 64);
    buf.extend((rdesc.len() as u16).to_le_bytes());
    buf.extend(0x05u16.to_le_bytes()); // BUS_BLUETOOTH
    buf.extend(0x056au32.to_le_bytes()); // Wacom vendor id
    buf.extend(0x0001u32.to_le_bytes()); // product
    buf.extend(0u32.to_le_bytes()); // version
    buf.extend(0u32.to_le_bytes()); // country
    let mut rd = rdesc.to_vec();
    rd.resize(HID_MAX_DESCRIPTOR_SIZE, 0);
    buf.extend(rd);
    buf
}

/// Encode a `UHID_INPUT2` frame.
pub fn input2_frame(report: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 2 + HID_MAX_DESCRIPTOR_SIZE);
    buf.extend(UHID_INPUT2.to_le_bytes());
    buf.extend((report.len() as u16).to_le_bytes());
    let mut data = report.to_vec();
    data.resize(HID_MAX_DESCRIPTOR_SIZE, 0);
    buf.extend(data);
    buf
}

/// Encode one stylus input report.
pub fn pen_input_report(in_range: bool, x: u16, y: u16, pressure: u16) -> [u8; 8] {
    let xb = x.to_le_bytes();
    let yb = y.to_le_bytes();
    let pb = pressure.to_le_bytes();
    [
        0x01,
        in_range as u8,
        xb[0],
        xb[1],
        yb[0],
        yb[1],
        pb[0],
        pb[1],
    ]
}

/// A virtual pen backed by a kernel UHID device on a caller-supplied fd.
///
/// Point records may carry only the axes that changed; the sink keeps the
/// running absolute state and reports it whole.
pub struct UhidPenSink {
    file: File,
    x: u16,
    y: u16,
    pressure: u16,
}

impl UhidPenSink {
    /// Take ownership of `fd` and announce the device to the kernel.
    ///
    /// # Safety-adjacent note
    /// `fd` must be an open, writable file descriptor; the sink owns and
    /// closes it.
    pub fn create(fd: RawFd, device_name: &str, rdesc: &[u8]) -> io::Result<UhidPenSink> {
        let mut file = unsafe { File::from_raw_fd(fd) };
        let uniq = format!("uhid_{}", Uuid::new_v4());
        file.write_all(&create2_frame(device_name, &uniq, rdesc))?;
        debug!("created uhid device '{device_name}' on fd {fd}");
        Ok(UhidPenSink {
            file,
            x: 0,
            y: 0,
            pressure: 0,
        })
    }
}

impl PenEventSink for UhidPenSink {
    fn point(&mut self, point: &RawPoint) -> io::Result<()> {
        if let Some((x, y)) = point.position {
            self.x = x.clamp(0, u16::MAX as i32) as u16;
            self.y = y.clamp(0, u16::MAX as i32) as u16;
        }
        if let Some(p) = point.pressure {
            self.pressure = p.clamp(0, u16::MAX as i32) as u16;
        }
        let report = pen_input_report(true, self.x, self.y, self.pressure);
        self.file.write_all(&input2_frame(&report))
    }

    fn pen_up(&mut self) -> io::Result<()> {
        self.pressure = 0;
        let report = pen_input_report(false, 0, 0, 0);
        self.file.write_all(&input2_frame(&report))
    }
}

impl Drop for UhidPenSink {
    fn drop(&mut self) {
        let _ = self.file.write_all(&UHID_DESTROY.to_le_bytes());
    }
}

/// Test sink collecting the event stream.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub points: Vec<RawPoint>,
    pub pen_ups: usize,
}

#[cfg(test)]
impl PenEventSink for RecordingSink {
    fn point(&mut self, point: &RawPoint) -> io::Result<()> {
        self.points.push(point.clone());
        Ok(())
    }

    fn pen_up(&mut self) -> io::Result<()> {
        self.pen_ups += 1;
        Ok(())
    }
}
