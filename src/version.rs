//! Build-time version and commit identification.
//!
//! Both values are process-wide immutable constants. The release pipeline
//! injects them through environment variables at build time; local builds
//! fall back to the crate version and an "unknown" commit.

/// Version tag for this build.
pub fn version_tag() -> &'static str {
    match option_env!("MESHVPN_VERSION_TAG") {
        Some(tag) => tag,
        None => env!("CARGO_PKG_VERSION"),
    }
}

/// Commit sha this build was produced from.
pub fn commit_sha() -> &'static str {
    match option_env!("MESHVPN_COMMIT_SHA") {
        Some(sha) => sha,
        None => "unknown",
    }
}
