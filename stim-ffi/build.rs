use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src");

    let (Ok(crate_dir), Ok(out_dir)) = (env::var("CARGO_MANIFEST_DIR"), env::var("OUT_DIR")) else {
        return;
    };

    let header = PathBuf::from(out_dir).join("stim_ffi.h");
    match cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("STIM_FFI_H")
        .with_no_includes()
        .with_sys_include("stdbool.h")
        .with_sys_include("stdint.h")
        .with_sys_include("stddef.h")
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(&header);
        }
        // Best effort: the library itself does not need the header
        Err(e) => println!("cargo:warning=C header not generated: {}", e),
    }
}
