use std::env;

fn main() {
    let target = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    if target == "riscv64" {
        // Link the kernel at its load address.
        println!("cargo:rustc-link-arg=-Tkernel/kernel.ld");
        println!("cargo:rerun-if-changed=kernel.ld");
    }

    println!("cargo:rerun-if-changed=build.rs");
}
