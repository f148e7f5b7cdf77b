//! Build script for the OBD adapter crate
//!
//! Links the vendor J2534 PassThru library when the `ffi` feature is on.

fn main() {
    println!("cargo:rerun-if-env-changed=J2534_LIB_DIR");
    println!("cargo:rerun-if-env-changed=J2534_LIB_NAME");

    if std::env::var_os("CARGO_FEATURE_FFI").is_none() {
        return;
    }

    if let Ok(dir) = std::env::var("J2534_LIB_DIR") {
        println!("cargo:rustc-link-search=native={}", dir);
    }

    let name = std::env::var("J2534_LIB_NAME").unwrap_or_else(|_| "j2534".to_string());
    println!("cargo:rustc-link-lib=dylib={}", name);
}
