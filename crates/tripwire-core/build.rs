//! Build script for tripwire-core
//!
//! Checks the toolchain before compilation:
//! - Minimum Rust version (let-else and `div_ceil` need 1.73.0+)
//! - Target platform (only Windows gets a process backend)

fn main()
{
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 73, 0);

        if rustc_version < min_rust_version {
            panic!("tripwire-core requires Rust {min_rust_version} or newer, found {rustc_version}");
        }
    } else {
        // Some build environments hide the compiler version
        println!("cargo:warning=could not verify Rust version");
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "windows" {
        println!("cargo:warning=tripwire-core: no process backend for {target_os}; building the portable core only");
    }
}
