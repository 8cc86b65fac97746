use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_GIT_DIRTY"),
    )
});

fn format_version(image: &str, sha: Option<&str>, dirty: Option<&str>) -> String {
    let sha = sha.map(|s| &s[..s.len().min(8)]).unwrap_or("unknown");
    let dirty = if dirty == Some("true") { "-dirty" } else { "" };
    format!("{image}-{sha}{dirty}")
}
