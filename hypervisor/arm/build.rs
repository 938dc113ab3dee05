use std::env;
use std::path::Path;

extern crate cc;

const TRAMPOLINE: &str = "src/asm/trampoline.S";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={TRAMPOLINE}");

    // host builds (tests) never switch exception levels and have no use for the trampoline
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if arch != "aarch64" {
        return;
    }

    cc::Build::new()
        .file(Path::new(TRAMPOLINE))
        .flag("-fno-pic")
        .flag("-mgeneral-regs-only")
        .compile("trampoline");
}
