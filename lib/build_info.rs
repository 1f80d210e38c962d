/// Build identity reported by `--version`, the logging bootstrap event and `/metrics`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("RING_REPAIR_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("RING_REPAIR_GIT_COMMIT_HASH")
);

/// Returns the first 12 characters of the commit hash, or `"unknown"` when the build had no git
/// metadata.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == "unknown" {
        return GIT_COMMIT_HASH;
    }

    let short_len = 12usize.min(GIT_COMMIT_HASH.len());
    &GIT_COMMIT_HASH[..short_len]
}
