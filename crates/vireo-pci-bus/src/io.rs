//! Bounds-checked access to programmed BARs.
//!
//! Every access is verified against the owning BAR's assigned window before it is forwarded to
//! the platform's [`IoAccess`] implementation, in the right address space for the BAR's kind.

use thiserror::Error;

use vireo_pci::config::BarKind;
use vireo_pci::{AccessError, AccessWidth, IoAccess};

use crate::device::PciDevice;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum BarAccessError {
    #[error("BAR {bar} is not implemented by this device")]
    Missing { bar: usize },
    #[error("BAR {bar} has no assigned address")]
    Unallocated { bar: usize },
    #[error("access outside BAR {bar} (offset {offset:#x}, width {width} bytes)")]
    OutOfRange { bar: usize, offset: u64, width: u16 },
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Verified access to one device's BAR windows.
pub struct BarAccess<'a, A: IoAccess + ?Sized> {
    access: &'a mut A,
}

impl<'a, A: IoAccess + ?Sized> BarAccess<'a, A> {
    pub fn new(access: &'a mut A) -> Self {
        Self { access }
    }

    pub fn read(
        &mut self,
        device: &PciDevice,
        bar: usize,
        offset: u64,
        width: AccessWidth,
    ) -> Result<u32, BarAccessError> {
        let (address, is_io) = resolve(device, bar, offset, width)?;
        let value = if is_io {
            self.access.io_read(address, width)?
        } else {
            self.access.mem_read(address, width)?
        };
        Ok(value)
    }

    pub fn write(
        &mut self,
        device: &PciDevice,
        bar: usize,
        offset: u64,
        width: AccessWidth,
        value: u32,
    ) -> Result<(), BarAccessError> {
        let (address, is_io) = resolve(device, bar, offset, width)?;
        if is_io {
            self.access.io_write(address, width, value)?;
        } else {
            self.access.mem_write(address, width, value)?;
        }
        Ok(())
    }
}

/// Checks the access against the BAR window and returns the absolute address and address space.
fn resolve(
    device: &PciDevice,
    bar: usize,
    offset: u64,
    width: AccessWidth,
) -> Result<(u64, bool), BarAccessError> {
    let descriptor = device.bars.get(bar).ok_or(BarAccessError::Missing { bar })?;
    if !device.allocated {
        return Err(BarAccessError::Unallocated { bar });
    }
    let width_bytes = u64::from(width.bytes());
    let end = offset
        .checked_add(width_bytes)
        .ok_or(BarAccessError::OutOfRange { bar, offset, width: width.bytes() })?;
    if end > descriptor.length {
        return Err(BarAccessError::OutOfRange { bar, offset, width: width.bytes() });
    }
    let is_io = matches!(descriptor.kind, BarKind::Io16 | BarKind::Io32);
    Ok((descriptor.base + offset, is_io))
}

#[cfg(test)]
mod tests {
    use super::{BarAccess, BarAccessError};
    use crate::device::{DeviceKind, PciBar, PciDevice};
    use std::collections::BTreeMap;
    use vireo_pci::config::{BarKind, ClassCode};
    use vireo_pci::{AccessError, AccessWidth, Bdf, IoAccess};

    #[derive(Default)]
    struct RecordingIo {
        io: BTreeMap<u64, u32>,
        mem: BTreeMap<u64, u32>,
    }

    impl IoAccess for RecordingIo {
        fn io_read(&mut self, addr: u64, _width: AccessWidth) -> Result<u32, AccessError> {
            Ok(*self.io.get(&addr).unwrap_or(&0))
        }
        fn io_write(&mut self, addr: u64, _width: AccessWidth, value: u32) -> Result<(), AccessError> {
            self.io.insert(addr, value);
            Ok(())
        }
        fn mem_read(&mut self, addr: u64, _width: AccessWidth) -> Result<u32, AccessError> {
            Ok(*self.mem.get(&addr).unwrap_or(&0))
        }
        fn mem_write(&mut self, addr: u64, _width: AccessWidth, value: u32) -> Result<(), AccessError> {
            self.mem.insert(addr, value);
            Ok(())
        }
    }

    fn device() -> PciDevice {
        let mut dev = PciDevice::new(
            Bdf::new(0, 1, 0),
            DeviceKind::Endpoint,
            0x1234,
            0x5678,
            ClassCode::from_register(0),
        );
        dev.bars = vec![
            PciBar { offset: 0x10, kind: BarKind::Mem32, length: 0x1000, alignment: 0xFFF, base: 0xE000_0000 },
            PciBar { offset: 0x14, kind: BarKind::Io16, length: 0x20, alignment: 0x1F, base: 0x2000 },
        ];
        dev.allocated = true;
        dev
    }

    #[test]
    fn accesses_route_to_the_right_address_space() {
        let dev = device();
        let mut io = RecordingIo::default();
        let mut bars = BarAccess::new(&mut io);

        bars.write(&dev, 0, 0x10, AccessWidth::Dword, 0xAABB_CCDD).unwrap();
        bars.write(&dev, 1, 0x4, AccessWidth::Word, 0x1234).unwrap();

        assert_eq!(io.mem.get(&0xE000_0010), Some(&0xAABB_CCDD));
        assert_eq!(io.io.get(&0x2004), Some(&0x1234));
    }

    #[test]
    fn out_of_range_accesses_are_refused() {
        let dev = device();
        let mut io = RecordingIo::default();
        let mut bars = BarAccess::new(&mut io);

        // The last dword of the window is fine; one past it is not.
        assert!(bars.read(&dev, 0, 0xFFC, AccessWidth::Dword).is_ok());
        assert!(matches!(
            bars.read(&dev, 0, 0xFFD, AccessWidth::Dword),
            Err(BarAccessError::OutOfRange { bar: 0, .. })
        ));
        assert!(matches!(
            bars.read(&dev, 5, 0, AccessWidth::Byte),
            Err(BarAccessError::Missing { bar: 5 })
        ));
    }

    #[test]
    fn unallocated_devices_are_refused() {
        let mut dev = device();
        dev.allocated = false;
        let mut io = RecordingIo::default();
        let mut bars = BarAccess::new(&mut io);
        assert!(matches!(
            bars.read(&dev, 0, 0, AccessWidth::Byte),
            Err(BarAccessError::Unallocated { bar: 0 })
        ));
    }
}
