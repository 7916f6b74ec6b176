// build.rs - link libcmem when the `cmem` feature is enabled
use std::{env, path::PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CMEM_LIB_DIR");
    println!("cargo:rerun-if-env-changed=CMEM_LIB_NAME");

    if env::var_os("CARGO_FEATURE_CMEM").is_none() {
        return;
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" {
        println!("cargo:warning=cmem feature is only supported on Linux targets");
        return;
    }

    // TI SDKs ship the library as cmem.a470MV / libticmem; allow overriding the name
    let lib_name = env::var("CMEM_LIB_NAME").unwrap_or_else(|_| String::from("cmem"));

    let mut lib_candidates = vec![
        PathBuf::from("/usr/local/lib"),
        PathBuf::from("/usr/lib"),
    ];
    if let Ok(dir) = env::var("CMEM_LIB_DIR") {
        lib_candidates.insert(0, PathBuf::from(dir));
    }
    for dir in lib_candidates.iter().filter(|p| p.exists()) {
        println!("cargo:rustc-link-search=native={}", dir.display());
    }

    println!("cargo:rustc-link-lib={}", lib_name);
}
