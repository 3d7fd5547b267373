//! Device registry - which USB HID devices accept a seed
//!
//! Only keys running firmware with the LOADKEY vendor extension are listed.
//! Everything else is ignored by discovery and the monitor.

use crate::types::TransportDeviceInfo;

/// FIDO HID usage page (interfaces speaking CTAPHID)
pub const FIDO_USAGE_PAGE: u16 = 0xF1D0;

/// Known (VID, PID) pairs of seedable keys
pub const SEEDABLE_DEVICES: &[(u16, u16)] = &[
    (0x10c4, 0x8acf), // Silicon Labs VID (SoloKeys Hacker / early Solo)
    (0x0483, 0xa2ca), // STMicroelectronics VID (Solo, Somu)
];

/// Check if a VID/PID pair belongs to a seedable key
#[inline]
pub fn is_seedable(vid: u16, pid: u16) -> bool {
    SEEDABLE_DEVICES.contains(&(vid, pid))
}

/// Check if a discovered device can be seeded
#[inline]
pub fn is_eligible(device: &TransportDeviceInfo) -> bool {
    is_seedable(device.vid, device.pid)
}

/// Check if this interface speaks CTAPHID.
///
/// Backends that don't report usage pages give 0; those are accepted.
#[inline]
pub fn is_fido_interface(usage_page: u16) -> bool {
    usage_page == 0 || usage_page == FIDO_USAGE_PAGE
}
