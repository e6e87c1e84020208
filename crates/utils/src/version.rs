//! Version string of the binaries, stamped by the build script.

use std::sync::LazyLock;

/// `<image version>-<git sha>`, with `-dirty` appended for builds from a
/// modified checkout.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    compose(
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_GIT_DIRTY"),
    )
});

fn compose(image: &str, sha: Option<&str>, dirty: Option<&str>) -> String {
    let suffix = if dirty == Some("true") { "-dirty" } else { "" };
    format!("{image}-{}{suffix}", sha.unwrap_or("unknown"))
}
