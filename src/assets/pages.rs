use crate::assets::glob_under;
use crate::blueprint::Blueprint;
use crate::core::TaskId;
use crate::error::GraphError;
use crate::output::Output;

pub const TASK: &str = "pages";

/// Collects the top level HTML pages, keyed by file name. Internal, the pages
/// are published by `inject`.
pub fn register(blueprint: &mut Blueprint) -> Result<TaskId, GraphError> {
    let root = blueprint.config().sources.html.clone();

    blueprint
        .task(TASK)
        .source(glob_under(&root, "*.html"))
        .internal()
        .run(|_, inputs| {
            Ok(inputs
                .files
                .iter()
                .filter_map(|file| {
                    let name = file.path.file_name()?;
                    Some(Output::binary(name, file.data.clone()))
                })
                .collect())
        })
}
