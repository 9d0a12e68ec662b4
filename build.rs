//! Build script for natctl
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `natctl version`, and lets packagers relocate the managed files.

fn main() {
    // Re-run build if these environment variables change
    println!("cargo:rerun-if-env-changed=NATCTL_SYSTEM_CONFIG_DIR");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
