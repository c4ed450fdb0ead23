fn main() {
    println!("cargo:rerun-if-changed=src/ffi");
    println!("cargo:rerun-if-changed=src/lib.rs");

    #[cfg(feature = "generate-header")]
    header::write();
}

/// Regenerates `include/sniffle.h` for the Android JNI shim and other C hosts.
#[cfg(feature = "generate-header")]
mod header {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    pub fn write() {
        let crate_dir = match env::var("CARGO_MANIFEST_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(error) => panic!("CARGO_MANIFEST_DIR unavailable: {error}"),
        };
        let include_dir = crate_dir.join("include");
        if let Err(error) = fs::create_dir_all(&include_dir) {
            panic!("cannot create {}: {error}", include_dir.display());
        }
        let target = include_dir.join("sniffle.h");
        match cbindgen::generate(&crate_dir) {
            Ok(bindings) => {
                if bindings.write_to_file(&target) {
                    println!("cargo:warning=regenerated {}", target.display());
                }
            }
            Err(error) => panic!("cbindgen failed: {error}"),
        }
    }
}
