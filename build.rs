use std::env::var;

fn main() {
    // set the linker script for the bare-metal target
    let arch = var("CARGO_CFG_TARGET_ARCH").unwrap();
    if arch == "riscv64" {
        println!("cargo:rustc-link-arg=-Tlinkers/{arch}.ld");
    }

    println!("cargo:rerun-if-changed=src/");
    println!("cargo:rerun-if-changed=linkers/");

    // set envs
    let build_time = chrono::offset::Local::now().format("%Y-%m-%d %H:%M:%S %Z");
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);
}
