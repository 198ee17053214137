//! Tests for reading export tables out of a target

mod common;

use common::{pe_image, SimulatedTarget, EXPORT_DIRECTORY_RVA};
use tripwire_core::agent::AgentExports;
use tripwire_core::remote::RemoteExports;
use tripwire_core::types::{Address, Bitness};
use tripwire_core::TripwireError;

const MODULE: u64 = 0x7000_0000;

fn mapped(bitness: Bitness, exports: &[(&str, u32)]) -> SimulatedTarget
{
    let target = SimulatedTarget::new(bitness);
    target.map(Address::new(MODULE), pe_image(bitness, exports));
    target
}

#[test]
fn test_exports_resolve_in_64_bit_image()
{
    let target = mapped(Bitness::X64, &[("init", 0x2000), ("uninit", 0x2010)]);
    let exports = RemoteExports::read(&target, Address::new(MODULE)).unwrap();

    assert_eq!(exports.names().collect::<Vec<_>>(), vec!["init", "uninit"]);
    assert_eq!(exports.require("init").unwrap(), Address::new(MODULE + 0x2000));
    assert_eq!(exports.require("uninit").unwrap(), Address::new(MODULE + 0x2010));
    assert_eq!(exports.ordinal_base(), 1);
}

#[test]
fn test_exports_resolve_in_32_bit_image()
{
    let target = mapped(Bitness::X86, &[("refresh", 0x2400)]);
    let exports = RemoteExports::read(&target, Address::new(MODULE)).unwrap();
    assert_eq!(exports.find("refresh").unwrap(), Some(Address::new(MODULE + 0x2400)));
}

#[test]
fn test_missing_export_is_not_found()
{
    let target = mapped(Bitness::X64, &[("init", 0x2000)]);
    let exports = RemoteExports::read(&target, Address::new(MODULE)).unwrap();

    assert_eq!(exports.find("uninit").unwrap(), None);
    match exports.require("uninit") {
        Err(TripwireError::ExportNotFound { name, module }) => {
            assert_eq!(name, "uninit");
            assert_eq!(module, Address::new(MODULE));
        }
        other => panic!("expected ExportNotFound, got {other:?}"),
    }
}

#[test]
fn test_forwarded_export_rejected()
{
    // A function RVA inside the export directory is a forwarder string
    let target = mapped(Bitness::X64, &[("init", EXPORT_DIRECTORY_RVA + 0x10)]);
    let exports = RemoteExports::read(&target, Address::new(MODULE)).unwrap();
    assert!(matches!(exports.find("init"), Err(TripwireError::InvalidImage { .. })));
}

#[test]
fn test_garbage_headers_rejected()
{
    let target = SimulatedTarget::new(Bitness::X64);
    target.map(Address::new(MODULE), vec![0xCC; 0x2000]);
    assert!(matches!(
        RemoteExports::read(&target, Address::new(MODULE)),
        Err(TripwireError::InvalidImage { .. })
    ));
}

#[test]
fn test_empty_export_table()
{
    let target = mapped(Bitness::X64, &[]);
    let exports = RemoteExports::read(&target, Address::new(MODULE)).unwrap();
    assert_eq!(exports.names().count(), 0);
    assert_eq!(exports.find("init").unwrap(), None);
}

#[test]
fn test_agent_exports_optional_entries()
{
    let target = mapped(Bitness::X64, &[("init", 0x2000), ("uninit", 0x2010), ("refresh", 0x2020)]);
    let exports = AgentExports::resolve(&RemoteExports::read(&target, Address::new(MODULE)).unwrap()).unwrap();

    assert_eq!(exports.init, Address::new(MODULE + 0x2000));
    assert_eq!(exports.uninit, Address::new(MODULE + 0x2010));
    assert_eq!(exports.refresh, Some(Address::new(MODULE + 0x2020)));
    assert_eq!(exports.install_breakpoint, None);
    assert_eq!(exports.clear_breakpoint, None);
}

#[test]
fn test_agent_exports_require_init()
{
    let target = mapped(Bitness::X64, &[("uninit", 0x2010)]);
    let exports = RemoteExports::read(&target, Address::new(MODULE)).unwrap();
    assert!(matches!(
        AgentExports::resolve(&exports),
        Err(TripwireError::ExportNotFound { name, .. }) if name == "init"
    ));
}
