use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // Stamp the build moment so hosts can tell driver builds apart.
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    println!("cargo:rustc-env=NMEA_DRIVER_BUILD_ID={stamp}");
}
