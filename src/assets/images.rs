use camino::Utf8Path;

use crate::assets::glob_under;
use crate::blueprint::Blueprint;
use crate::core::TaskId;
use crate::error::GraphError;
use crate::output::{Output, normalize_path};

pub const TASK: &str = "images";

/// Copies everything under the images root into `img/`, keeping the
/// directory layout.
pub fn register(blueprint: &mut Blueprint) -> Result<TaskId, GraphError> {
    let root = blueprint.config().sources.images.clone();
    let prefix = normalize_path(&root);

    blueprint
        .task(TASK)
        .source(glob_under(&root, "**/*"))
        .run(move |_, inputs| {
            Ok(inputs
                .files
                .iter()
                .map(|file| {
                    let relative = file.path.strip_prefix(&prefix).unwrap_or(&file.path);
                    Output::binary(Utf8Path::new("img").join(relative), file.data.clone())
                })
                .collect())
        })
}
