use std::env;

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    let crate_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo");

    cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("AWQ_DEQUANT_H")
        .with_parse_deps(true)
        .with_parse_include(&["awq-dequant"])
        .with_tab_width(4)
        .with_line_length(100)
        .generate()
        .expect("Unable to generate bindings")
        .write_to_file("awq_dequant.h");
}
