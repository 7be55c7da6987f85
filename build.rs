use std::time::{SystemTime, UNIX_EPOCH};

/// Stamp the build time into the binary so patch bundles can record which
/// build produced them. `SOURCE_DATE_EPOCH` wins when set, keeping
/// reproducible builds reproducible.
fn main() {
    let secs = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|z| z.parse::<u64>().ok())
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });
    println!("cargo:rustc-env=CHERT_BUILD_EPOCH={secs}");
}
