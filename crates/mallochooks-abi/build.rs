fn main() {
    println!("cargo:rustc-check-cfg=cfg(mallochooks_frame_pointers)");
    // Caller attribution reads the return address through the frame pointer,
    // which is only sound when every frame keeps one.
    let flags = std::env::var("CARGO_ENCODED_RUSTFLAGS").unwrap_or_default();
    let forced = flags.split('\x1f').any(|flag| {
        flag.trim_start_matches("-C")
            .trim()
            .strip_prefix("force-frame-pointers=")
            .is_some_and(|v| matches!(v, "yes" | "y" | "on" | "true"))
    });
    if forced {
        println!("cargo:rustc-cfg=mallochooks_frame_pointers");
    }
    println!("cargo:rerun-if-env-changed=CARGO_ENCODED_RUSTFLAGS");
}
