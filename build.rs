fn main() {
    // CoreBluetooth refuses to connect from a binary without an embedded
    // Info.plist carrying NSBluetoothAlwaysUsageDescription. CLI tools get one
    // by placing the plist in the __TEXT,__info_plist section at link time.
    //
    // CARGO_CFG_TARGET_OS is the *target* OS, so cross builds behave too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let dir = std::env::var("CARGO_MANIFEST_DIR")
            .expect("CARGO_MANIFEST_DIR must be set by Cargo");

        let plist = format!("{dir}/Info.plist");

        // ld … -sectcreate __TEXT __info_plist <plist>
        for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
            println!("cargo:rustc-link-arg-bins={arg}");
        }

        println!("cargo:rerun-if-changed=Info.plist");
    }
}
