use std::env;
use std::path::PathBuf;

use wayland_scanner::{generate_code, Side};

const TOPLEVEL_EXPORT: &str = "protocols/hyprland-toplevel-export-v1.xml";

fn main() {
    println!("cargo:rerun-if-changed={}", TOPLEVEL_EXPORT);
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"));
    generate_code(
        TOPLEVEL_EXPORT,
        out_dir.join("hyprland_toplevel_export_v1.rs"),
        Side::Client,
    );
}
