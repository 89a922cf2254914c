//! Device-control requests: attach a backend disk, detach by unit number.

use crate::backend::AttachBackend;
use crate::bus::BusInner;
use crate::error::{BusError, Result, Status};
use crate::irp::{DeviceControlRequest, Information, Irp, Request};

const FILE_DEVICE_CONTROLLER: u32 = 0x0000_0004;
const METHOD_BUFFERED: u32 = 0;
const FILE_READ_DATA: u32 = 1;
const FILE_WRITE_DATA: u32 = 2;

const fn ctl_code(function: u32) -> u32 {
    (FILE_DEVICE_CONTROLLER << 16)
        | ((FILE_READ_DATA | FILE_WRITE_DATA) << 14)
        | (function << 2)
        | METHOD_BUFFERED
}

pub const IOCTL_FILE_ATTACH: u32 = ctl_code(0x800);
pub const IOCTL_FILE_DETACH: u32 = ctl_code(0x801);
pub const IOCTL_DUMMY: u32 = ctl_code(0x802);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    FileAttach,
    FileDetach,
    DummyAttach,
    Unknown(u32),
}

impl From<u32> for ControlCode {
    fn from(code: u32) -> Self {
        match code {
            IOCTL_FILE_ATTACH => ControlCode::FileAttach,
            IOCTL_FILE_DETACH => ControlCode::FileDetach,
            IOCTL_DUMMY => ControlCode::DummyAttach,
            other => ControlCode::Unknown(other),
        }
    }
}

/// Reads the unit number a detach request carries: a little-endian `u32` at the start of a
/// buffer of at least four bytes.
pub fn parse_unit_number(input: Option<&[u8]>, input_length: usize) -> Result<u32> {
    const NEEDED: usize = std::mem::size_of::<u32>();

    let got = input.map_or(0, |buf| input_length.min(buf.len()));
    let bytes = match input {
        Some(buf) if got >= NEEDED => &buf[..NEEDED],
        _ => return Err(BusError::InvalidBuffer { needed: NEEDED, got }),
    };
    let mut raw = [0u8; NEEDED];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}

pub(crate) fn dispatch(bus: &BusInner, mut irp: Irp) -> Status {
    let Request::DeviceControl(request) = irp.request() else {
        irp.complete_with(Status::InvalidDeviceRequest);
        return Status::InvalidDeviceRequest;
    };

    let result = match ControlCode::from(request.code) {
        ControlCode::FileAttach => attach(bus, &*bus.backends.file, request),
        ControlCode::DummyAttach => attach(bus, &*bus.backends.dummy, request),
        ControlCode::FileDetach => detach(bus, request).map(|()| Information::None),
        ControlCode::Unknown(code) => {
            tracing::debug!(code = format_args!("{code:#010x}"), "unknown control code");
            Err(BusError::InvalidDeviceRequest(code))
        }
    };

    let status = match result {
        Ok(information) => {
            irp.set_information(information);
            Status::Success
        }
        Err(err) => {
            tracing::warn!(%err, "control request failed");
            err.status()
        }
    };
    irp.complete_with(status);
    status
}

fn attach(
    bus: &BusInner,
    backend: &dyn AttachBackend,
    request: &DeviceControlRequest,
) -> Result<Information> {
    let input = request.input.as_deref().unwrap_or(&[]);
    let input = &input[..request.input_length.min(input.len())];
    let disk = backend.attach(input)?;
    Ok(Information::Unit(bus.add_device(disk)?))
}

fn detach(bus: &BusInner, request: &DeviceControlRequest) -> Result<()> {
    let unit = parse_unit_number(request.input.as_deref(), request.input_length)?;
    bus.detach_unit(unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_codes_round_trip() {
        assert_eq!(ControlCode::from(IOCTL_FILE_ATTACH), ControlCode::FileAttach);
        assert_eq!(ControlCode::from(IOCTL_FILE_DETACH), ControlCode::FileDetach);
        assert_eq!(ControlCode::from(IOCTL_DUMMY), ControlCode::DummyAttach);
        assert_eq!(ControlCode::from(0x1234), ControlCode::Unknown(0x1234));
    }

    #[test]
    fn unit_number_is_little_endian() {
        let buf = 0x0102_0304u32.to_le_bytes();
        assert_eq!(parse_unit_number(Some(&buf), 4).unwrap(), 0x0102_0304);
    }

    #[test]
    fn unit_number_ignores_trailing_bytes() {
        let buf = [7, 0, 0, 0, 0xff, 0xff];
        assert_eq!(parse_unit_number(Some(&buf), buf.len()).unwrap(), 7);
    }

    #[test]
    fn short_or_missing_buffer_is_rejected() {
        assert!(matches!(
            parse_unit_number(Some(&[1, 0, 0]), 3),
            Err(BusError::InvalidBuffer { needed: 4, got: 3 })
        ));
        assert!(matches!(
            parse_unit_number(None, 4),
            Err(BusError::InvalidBuffer { needed: 4, got: 0 })
        ));
        // A declared length shorter than the buffer wins.
        assert!(matches!(
            parse_unit_number(Some(&[1, 0, 0, 0]), 2),
            Err(BusError::InvalidBuffer { needed: 4, got: 2 })
        ));
    }
}
