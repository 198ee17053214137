//! Tests for platform-agnostic types

use tripwire_core::classify::{classify, select_mode};
use tripwire_core::types::{
    AccessMode, Address, AddressClass, Bitness, DetectionMode, ModuleInfo, ProcessId, Protection, ThreadId,
    WatchpointConfig,
};
use tripwire_core::TripwireError;

#[test]
fn test_process_id_from_u32()
{
    let pid = ProcessId::from(4242);
    assert_eq!(pid.0, 4242);
    let value: u32 = pid.into();
    assert_eq!(value, 4242);
}

#[test]
fn test_address_display_is_zero_padded()
{
    assert_eq!(Address::new(0x1234).to_string(), "0x0000000000001234");
    assert_eq!(format!("{:x}", Address::new(0xdead)), "dead");
}

#[test]
fn test_address_page_math()
{
    let address = Address::new(0x0040_1234);
    assert_eq!(address.page_base(0x1000), Address::new(0x0040_1000));
    assert!(Address::new(0x1008).is_aligned(8));
    assert!(!Address::new(0x1004).is_aligned(8));
    assert_eq!(Address::new(u64::MAX).checked_add(1), None);
    assert_eq!(Address::new(0x1_0000_0000).to_u32(), None);
    assert_eq!(Address::new(0xFFFF_FFFF).to_u32(), Some(u32::MAX));
}

#[test]
fn test_watch_sizes()
{
    for size in [1, 2, 4, 8] {
        assert!(WatchpointConfig::new(Address::new(0x1000), size, AccessMode::ReadWrite).is_ok());
    }
    for size in [0, 3, 5, 16] {
        assert!(matches!(
            WatchpointConfig::new(Address::new(0x1000), size, AccessMode::ReadWrite),
            Err(TripwireError::InvalidSize(s)) if s == size
        ));
    }
}

#[test]
fn test_watch_covers_its_bytes_only()
{
    let watch = WatchpointConfig::new(Address::new(0x2000), 4, AccessMode::WriteOnly).unwrap();
    assert!(watch.covers(Address::new(0x2000)));
    assert!(watch.covers(Address::new(0x2003)));
    assert!(!watch.covers(Address::new(0x2004)));
    assert!(!watch.covers(Address::new(0x1FFF)));
}

#[test]
fn test_protection_flags()
{
    assert!(Protection::READ_WRITE.is_accessible());
    assert!(!Protection::NO_ACCESS.is_accessible());
    assert!(!Protection::READ_WRITE.is_guarded());

    let guarded = Protection::READ_WRITE.with_guard();
    assert!(guarded.is_guarded());
    assert_eq!(guarded.bits(), 0x104);
}

#[test]
fn test_module_contains()
{
    let module = ModuleInfo::new("game.exe", Address::new(0x40_0000), 0x1000);
    assert!(module.contains(Address::new(0x40_0000)));
    assert!(module.contains(Address::new(0x40_0FFF)));
    assert!(!module.contains(Address::new(0x40_1000)));
    assert!(!module.contains(Address::new(0x3F_FFFF)));
}

#[test]
fn test_mode_selection()
{
    let modules = vec![ModuleInfo::new("game.exe", Address::new(0x40_0000), 0x10000)];
    let global = classify(Address::new(0x40_0010), &modules);
    let heap = classify(Address::new(0x0200_0000), &modules);

    assert_eq!(global, AddressClass::Static);
    assert_eq!(heap, AddressClass::Dynamic);
    assert_eq!(select_mode(global, AccessMode::ReadWrite), DetectionMode::PageGuard);
    assert_eq!(select_mode(global, AccessMode::WriteOnly), DetectionMode::HardwareBreakpoint);
    assert_eq!(select_mode(heap, AccessMode::ReadWrite), DetectionMode::HardwareBreakpoint);
}

#[test]
fn test_display_names()
{
    assert_eq!(Bitness::X86.to_string(), "x86");
    assert_eq!(Bitness::X64.pointer_size(), 8);
    assert_eq!(AccessMode::ReadWrite.to_string(), "read/write");
    assert_eq!(DetectionMode::PageGuard.to_string(), "page guard");
    assert_eq!(ThreadId(7), ThreadId::from(7));
}
