//! Emulated configuration space for a single PCI function.
//!
//! Supports the three header shapes the enumerator has to cope with, with hardware-accurate
//! register behavior for the parts the engine touches:
//! - BAR size probing (write all-ones, read back the size mask, restore)
//! - bridge aperture registers whose low nibbles are read-only capability codes
//! - bridge windows that ignore writes entirely when the bridge does not implement them
//! - expansion-ROM BAR size masks

use vireo_pci::config::{self, HeaderKind};
use vireo_pci::AccessWidth;

const CONFIG_SPACE_SIZE: usize = 256;

/// Shape of one emulated BAR.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BarProfile {
    /// I/O BAR decoding only 16 address bits (size-mask upper half reads back zero).
    Io16 { size: u16 },
    Io32 { size: u32 },
    Mem32 { size: u32, prefetchable: bool },
    Mem64 { size: u64, prefetchable: bool },
}

impl BarProfile {
    fn size(&self) -> u64 {
        match *self {
            Self::Io16 { size } => u64::from(size),
            Self::Io32 { size } => u64::from(size),
            Self::Mem32 { size, .. } => u64::from(size),
            Self::Mem64 { size, .. } => size,
        }
    }

    fn is_64bit(&self) -> bool {
        matches!(self, Self::Mem64 { .. })
    }
}

/// I/O window capability of an emulated PCI-to-PCI bridge.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum IoWindow {
    None,
    #[default]
    Io16,
    Io32,
}

/// Prefetchable-memory window capability of an emulated PCI-to-PCI bridge.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum PrefWindow {
    None,
    #[default]
    PMem32,
    PMem64,
}

#[derive(Debug, Clone, Copy)]
struct BarState {
    profile: Option<BarProfile>,
    base: u64,
    probe: bool,
}

impl BarState {
    const EMPTY: BarState = BarState {
        profile: None,
        base: 0,
        probe: false,
    };
}

#[derive(Debug, Clone)]
pub struct ModelConfigSpace {
    bytes: [u8; CONFIG_SPACE_SIZE],
    header: HeaderKind,
    bars: [BarState; 6],
    rom_size: u32,
    rom_reg: u32,
    io_window: IoWindow,
    pref_window: PrefWindow,
}

impl ModelConfigSpace {
    pub fn endpoint(vendor_id: u16, device_id: u16) -> Self {
        Self::new(vendor_id, device_id, HeaderKind::Endpoint, 0x00)
    }

    pub fn pci_bridge(vendor_id: u16, device_id: u16) -> Self {
        let mut cfg = Self::new(vendor_id, device_id, HeaderKind::PciPciBridge, 0x01);
        cfg.set_class_code(0x06, 0x04, 0x00, 0x00);
        cfg
    }

    pub fn cardbus_bridge(vendor_id: u16, device_id: u16) -> Self {
        let mut cfg = Self::new(vendor_id, device_id, HeaderKind::CardBusBridge, 0x02);
        cfg.set_class_code(0x06, 0x07, 0x00, 0x00);
        cfg
    }

    fn new(vendor_id: u16, device_id: u16, header: HeaderKind, header_type: u8) -> Self {
        let mut bytes = [0u8; CONFIG_SPACE_SIZE];
        bytes[0x00..0x02].copy_from_slice(&vendor_id.to_le_bytes());
        bytes[0x02..0x04].copy_from_slice(&device_id.to_le_bytes());
        bytes[usize::from(config::HEADER_TYPE)] = header_type;

        Self {
            bytes,
            header,
            bars: [BarState::EMPTY; 6],
            rom_size: 0,
            rom_reg: 0,
            io_window: IoWindow::default(),
            pref_window: PrefWindow::default(),
        }
    }

    pub fn header_kind(&self) -> HeaderKind {
        self.header
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8, revision_id: u8) {
        self.bytes[0x08] = revision_id;
        self.bytes[0x09] = prog_if;
        self.bytes[0x0A] = subclass;
        self.bytes[0x0B] = class;
    }

    pub fn set_multifunction(&mut self, multifunction: bool) {
        let addr = usize::from(config::HEADER_TYPE);
        if multifunction {
            self.bytes[addr] |= config::HEADER_TYPE_MULTIFUNCTION;
        } else {
            self.bytes[addr] &= !config::HEADER_TYPE_MULTIFUNCTION;
        }
    }

    pub fn set_io_window(&mut self, window: IoWindow) {
        assert_eq!(self.header, HeaderKind::PciPciBridge);
        self.io_window = window;
    }

    pub fn set_pref_window(&mut self, window: PrefWindow) {
        assert_eq!(self.header, HeaderKind::PciPciBridge);
        self.pref_window = window;
    }

    pub fn set_expansion_rom_size(&mut self, size: u32) {
        assert!(size == 0 || size.is_power_of_two());
        assert!(size == 0 || size >= 0x800, "ROM windows are at least 2KiB");
        self.rom_size = size;
    }

    /// Defines a BAR. A 64-bit BAR consumes the next slot as its high dword.
    pub fn set_bar(&mut self, index: usize, profile: BarProfile) {
        assert!(index < self.header.bar_count());
        let size = profile.size();
        assert!(size.is_power_of_two(), "BAR sizes are powers of two");
        if profile.is_64bit() {
            assert!(index + 1 < self.header.bar_count(), "64-bit BAR needs a high slot");
            assert!(self.bars[index + 1].profile.is_none());
        }
        if index > 0 {
            assert!(
                !matches!(self.bars[index - 1].profile, Some(p) if p.is_64bit()),
                "slot is the high dword of the previous BAR"
            );
        }
        self.bars[index] = BarState {
            profile: Some(profile),
            base: 0,
            probe: false,
        };
    }

    pub fn command(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0x04], self.bytes[0x05]])
    }

    pub fn primary_bus(&self) -> u8 {
        self.bytes[usize::from(config::PRIMARY_BUS)]
    }

    pub fn secondary_bus(&self) -> u8 {
        self.bytes[usize::from(config::SECONDARY_BUS)]
    }

    pub fn subordinate_bus(&self) -> u8 {
        self.bytes[usize::from(config::SUBORDINATE_BUS)]
    }

    pub fn bar_base(&self, index: usize) -> u64 {
        self.bars[index].base
    }

    /// Decoded I/O window of a Type 1 bridge, `None` when closed or unimplemented.
    pub fn io_aperture(&self) -> Option<(u64, u64)> {
        if matches!(self.io_window, IoWindow::None) {
            return None;
        }
        let upper = |off: u16| {
            u64::from(u16::from_le_bytes([
                self.bytes[usize::from(off)],
                self.bytes[usize::from(off) + 1],
            ]))
        };
        let base = (u64::from(self.bytes[usize::from(config::IO_BASE)] & 0xF0) << 8)
            | (upper(config::IO_BASE_UPPER16) << 16);
        let limit = (u64::from(self.bytes[usize::from(config::IO_LIMIT)] & 0xF0) << 8)
            | (upper(config::IO_LIMIT_UPPER16) << 16)
            | 0xFFF;
        if base > limit {
            return None;
        }
        Some((base, limit))
    }

    /// Decoded non-prefetchable memory window of a Type 1 bridge.
    pub fn mem_aperture(&self) -> Option<(u64, u64)> {
        let reg = |off: u16| {
            u64::from(
                u16::from_le_bytes([self.bytes[usize::from(off)], self.bytes[usize::from(off) + 1]])
                    & 0xFFF0,
            )
        };
        let base = reg(config::MEM_BASE) << 16;
        let limit = (reg(config::MEM_LIMIT) << 16) | 0xF_FFFF;
        if base > limit {
            return None;
        }
        Some((base, limit))
    }

    /// Decoded prefetchable memory window of a Type 1 bridge, including the upper dwords.
    pub fn pref_aperture(&self) -> Option<(u64, u64)> {
        if matches!(self.pref_window, PrefWindow::None) {
            return None;
        }
        let reg16 = |off: u16| {
            u64::from(
                u16::from_le_bytes([self.bytes[usize::from(off)], self.bytes[usize::from(off) + 1]])
                    & 0xFFF0,
            )
        };
        let reg32 = |off: u16| {
            let off = usize::from(off);
            u64::from(u32::from_le_bytes(
                self.bytes[off..off + 4].try_into().expect("4-byte field"),
            ))
        };
        let base = (reg16(config::PREF_MEM_BASE) << 16) | (reg32(config::PREF_BASE_UPPER32) << 32);
        let limit = (reg16(config::PREF_MEM_LIMIT) << 16)
            | (reg32(config::PREF_LIMIT_UPPER32) << 32)
            | 0xF_FFFF;
        if base > limit {
            return None;
        }
        Some((base, limit))
    }

    fn reg32(&self, off: u16) -> u32 {
        let off = usize::from(off);
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().expect("4-byte field"))
    }

    /// Decoded CardBus memory window 0 or 1. The limit's low 12 bits are implied ones.
    pub fn cardbus_mem_aperture(&self, window: usize) -> Option<(u32, u32)> {
        let (base_off, limit_off) = match window {
            0 => (config::CARDBUS_MEM_BASE_0, config::CARDBUS_MEM_LIMIT_0),
            1 => (config::CARDBUS_MEM_BASE_1, config::CARDBUS_MEM_LIMIT_1),
            _ => panic!("CardBus bridges have two memory windows"),
        };
        let base = self.reg32(base_off) & 0xFFFF_F000;
        let limit_reg = self.reg32(limit_off) & 0xFFFF_F000;
        if base > limit_reg {
            return None;
        }
        Some((base, limit_reg | 0xFFF))
    }

    /// Decoded CardBus I/O window 0 or 1. The limit's low 2 bits are implied ones.
    pub fn cardbus_io_aperture(&self, window: usize) -> Option<(u32, u32)> {
        let (base_off, limit_off) = match window {
            0 => (config::CARDBUS_IO_BASE_0, config::CARDBUS_IO_LIMIT_0),
            1 => (config::CARDBUS_IO_BASE_1, config::CARDBUS_IO_LIMIT_1),
            _ => panic!("CardBus bridges have two I/O windows"),
        };
        let base = self.reg32(base_off) & 0xFFFF_FFFC;
        let limit_reg = self.reg32(limit_off) & 0xFFFF_FFFC;
        if base > limit_reg {
            return None;
        }
        Some((base, limit_reg | 0x3))
    }

    pub fn bridge_control(&self) -> u16 {
        u16::from_le_bytes([
            self.bytes[usize::from(config::BRIDGE_CONTROL)],
            self.bytes[usize::from(config::BRIDGE_CONTROL) + 1],
        ])
    }

    fn bar_region(&self) -> core::ops::Range<usize> {
        0x10..0x10 + 4 * self.header.bar_count()
    }

    fn rom_offset(&self) -> Option<usize> {
        self.header.rom_bar_offset().map(usize::from)
    }

    pub fn read(&self, offset: u16, width: AccessWidth) -> u32 {
        let offset = usize::from(offset);
        let size = usize::from(width.bytes());
        assert!(offset + size <= CONFIG_SPACE_SIZE);
        assert_eq!(offset % size, 0, "config reads are naturally aligned");

        let aligned = offset & !0x3;
        if self.bar_region().contains(&aligned) {
            let value = self.read_bar_register((aligned - 0x10) / 4);
            return (value >> ((offset - aligned) * 8)) & width.mask();
        }
        if Some(aligned) == self.rom_offset() {
            let value = if self.rom_size == 0 { 0 } else { self.rom_reg };
            return (value >> ((offset - aligned) * 8)) & width.mask();
        }

        let mut value = 0u32;
        for i in 0..size {
            value |= u32::from(self.bytes[offset + i]) << (8 * i);
        }
        value
    }

    pub fn write(&mut self, offset: u16, width: AccessWidth, value: u32) {
        let offset = usize::from(offset);
        let size = usize::from(width.bytes());
        assert!(offset + size <= CONFIG_SPACE_SIZE);
        assert_eq!(offset % size, 0, "config writes are naturally aligned");

        if self.bar_region().contains(&offset) {
            assert_eq!(size, 4, "BAR writes are 32-bit");
            self.write_bar_register((offset - 0x10) / 4, value);
            return;
        }
        if Some(offset) == self.rom_offset() && size == 4 {
            if self.rom_size != 0 {
                self.rom_reg =
                    (value & 0xFFFF_F800 & !(self.rom_size - 1)) | (value & 0x1);
            }
            return;
        }

        for i in 0..size {
            self.write_byte(offset + i, ((value >> (8 * i)) & 0xFF) as u8);
        }
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        if self.is_read_only_byte(addr) {
            return;
        }
        let masked = match self.header {
            HeaderKind::PciPciBridge => match addr {
                a if a == usize::from(config::IO_BASE) || a == usize::from(config::IO_LIMIT) => {
                    let cap = match self.io_window {
                        IoWindow::None => return,
                        IoWindow::Io16 => 0x0,
                        IoWindow::Io32 => 0x1,
                    };
                    (value & 0xF0) | cap
                }
                // Memory base/limit low bytes: bits 3:0 are reserved-zero.
                a if a == usize::from(config::MEM_BASE) || a == usize::from(config::MEM_LIMIT) => {
                    value & 0xF0
                }
                a if a == usize::from(config::PREF_MEM_BASE)
                    || a == usize::from(config::PREF_MEM_LIMIT) =>
                {
                    let cap = match self.pref_window {
                        PrefWindow::None => return,
                        PrefWindow::PMem32 => 0x0,
                        PrefWindow::PMem64 => 0x1,
                    };
                    (value & 0xF0) | cap
                }
                // High bytes of the 16-bit prefetchable base/limit registers.
                a if a == usize::from(config::PREF_MEM_BASE) + 1
                    || a == usize::from(config::PREF_MEM_LIMIT) + 1 =>
                {
                    if matches!(self.pref_window, PrefWindow::None) {
                        return;
                    }
                    value
                }
                a if (usize::from(config::PREF_BASE_UPPER32)
                    ..usize::from(config::PREF_BASE_UPPER32) + 4)
                    .contains(&a)
                    || (usize::from(config::PREF_LIMIT_UPPER32)
                        ..usize::from(config::PREF_LIMIT_UPPER32) + 4)
                        .contains(&a) =>
                {
                    if !matches!(self.pref_window, PrefWindow::PMem64) {
                        return;
                    }
                    value
                }
                a if (usize::from(config::IO_BASE_UPPER16)
                    ..usize::from(config::IO_LIMIT_UPPER16) + 2)
                    .contains(&a) =>
                {
                    if !matches!(self.io_window, IoWindow::Io32) {
                        return;
                    }
                    value
                }
                _ => value,
            },
            HeaderKind::CardBusBridge => match addr {
                // CardBus memory windows are 4KiB-granular: low 12 bits reserved-zero.
                a if Self::is_cardbus_mem_reg(a) => match a & 0x3 {
                    0 => 0,
                    1 => value & 0xF0,
                    _ => value,
                },
                // CardBus I/O windows are dword-granular.
                a if Self::is_cardbus_io_reg(a) => {
                    if a & 0x3 == 0 {
                        value & 0xFC
                    } else {
                        value
                    }
                }
                _ => value,
            },
            HeaderKind::Endpoint => value,
        };
        self.bytes[addr] = masked;
    }

    fn is_cardbus_mem_reg(addr: usize) -> bool {
        (usize::from(config::CARDBUS_MEM_BASE_0)..usize::from(config::CARDBUS_MEM_LIMIT_1) + 4)
            .contains(&addr)
    }

    fn is_cardbus_io_reg(addr: usize) -> bool {
        (usize::from(config::CARDBUS_IO_BASE_0)..usize::from(config::CARDBUS_IO_LIMIT_1) + 4)
            .contains(&addr)
    }

    fn is_read_only_byte(&self, addr: usize) -> bool {
        if addr < 0x04 {
            return true;
        }
        // Status register bits are device-managed.
        if (0x06..0x08).contains(&addr) {
            return true;
        }
        // Revision ID / class code.
        if (0x08..0x0C).contains(&addr) {
            return true;
        }
        if addr == usize::from(config::HEADER_TYPE) {
            return true;
        }
        false
    }

    fn read_bar_register(&self, index: usize) -> u32 {
        if index >= self.header.bar_count() {
            return 0;
        }

        // High dword of a 64-bit BAR: consult the previous slot's state.
        if self.bars[index].profile.is_none() && index > 0 {
            if let Some(BarProfile::Mem64 { size, .. }) = self.bars[index - 1].profile {
                let low = &self.bars[index - 1];
                if low.probe {
                    return (!(size - 1) >> 32) as u32;
                }
                return (low.base >> 32) as u32;
            }
        }

        let bar = &self.bars[index];
        let Some(profile) = bar.profile else {
            return 0;
        };

        if bar.probe {
            return match profile {
                BarProfile::Io16 { size } => (!(u32::from(size) - 1) & 0xFFFC) | 0x1,
                BarProfile::Io32 { size } => (!(size - 1) & 0xFFFF_FFFC) | 0x1,
                BarProfile::Mem32 { size, prefetchable } => {
                    let mut mask = !(size - 1) & 0xFFFF_FFF0;
                    if prefetchable {
                        mask |= 1 << 3;
                    }
                    mask
                }
                BarProfile::Mem64 { size, prefetchable } => {
                    let mut mask = (!(size - 1)) as u32 & 0xFFFF_FFF0;
                    mask |= 0b10 << 1;
                    if prefetchable {
                        mask |= 1 << 3;
                    }
                    mask
                }
            };
        }

        match profile {
            BarProfile::Io16 { .. } | BarProfile::Io32 { .. } => {
                (bar.base as u32 & 0xFFFF_FFFC) | 0x1
            }
            BarProfile::Mem32 { prefetchable, .. } => {
                let mut val = bar.base as u32 & 0xFFFF_FFF0;
                if prefetchable {
                    val |= 1 << 3;
                }
                val
            }
            BarProfile::Mem64 { prefetchable, .. } => {
                let mut val = bar.base as u32 & 0xFFFF_FFF0;
                val |= 0b10 << 1;
                if prefetchable {
                    val |= 1 << 3;
                }
                val
            }
        }
    }

    fn write_bar_register(&mut self, index: usize, value: u32) {
        if index >= self.header.bar_count() {
            return;
        }

        // High dword of a 64-bit BAR.
        if self.bars[index].profile.is_none()
            && index > 0
            && matches!(self.bars[index - 1].profile, Some(p) if p.is_64bit())
        {
            let low = index - 1;
            if value == 0xFFFF_FFFF {
                self.bars[low].probe = true;
                return;
            }
            let low_part = self.bars[low].base & 0xFFFF_FFFF;
            let base = Self::mask_base(self.bars[low].profile.expect("64-bit low BAR"),
                low_part | (u64::from(value) << 32));
            self.bars[low].base = base;
            self.bars[low].probe = false;
            return;
        }

        let Some(profile) = self.bars[index].profile else {
            return;
        };

        if value == 0xFFFF_FFFF {
            self.bars[index].probe = true;
            return;
        }

        let base = match profile {
            BarProfile::Io16 { .. } | BarProfile::Io32 { .. } => u64::from(value & 0xFFFF_FFFC),
            BarProfile::Mem32 { .. } => u64::from(value & 0xFFFF_FFF0),
            BarProfile::Mem64 { .. } => {
                let high = self.bars[index].base & !0xFFFF_FFFF;
                u64::from(value & 0xFFFF_FFF0) | high
            }
        };
        self.bars[index].base = Self::mask_base(profile, base);
        self.bars[index].probe = false;
    }

    fn mask_base(profile: BarProfile, base: u64) -> u64 {
        base & !(profile.size() - 1)
    }
}
