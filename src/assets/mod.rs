//! The front-end asset pipeline, expressed as tasks.
//!
//! ```text
//! styles ──┐
//! scripts ─┼─> inject
//! pages ───┘
//! images
//! ```
//!
//! Every task reads from one of the [`SourceRoots`](crate::config::SourceRoots)
//! of the configuration. `pages` is internal: its output only feeds `inject`,
//! which publishes the final HTML.

pub mod images;
pub mod inject;
pub mod pages;
pub mod scripts;
pub mod styles;

use camino::Utf8Path;

use crate::blueprint::Blueprint;
use crate::error::GraphError;

/// Register every asset task on `blueprint`.
pub fn design(blueprint: &mut Blueprint) -> Result<(), GraphError> {
    styles::register(blueprint)?;
    scripts::register(blueprint)?;
    pages::register(blueprint)?;
    images::register(blueprint)?;
    inject::register(blueprint)?;
    Ok(())
}

/// Join a source root with a glob suffix, escaping the root so that
/// brackets or stars in directory names match literally.
pub(crate) fn glob_under(root: &Utf8Path, suffix: &str) -> String {
    let root = glob::Pattern::escape(root.as_str());
    if root.is_empty() {
        suffix.to_string()
    } else {
        format!("{root}/{suffix}")
    }
}
