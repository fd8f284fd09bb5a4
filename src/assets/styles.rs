use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::assets::glob_under;
use crate::blueprint::Blueprint;
use crate::core::TaskId;
use crate::error::GraphError;
use crate::output::Output;

pub const TASK: &str = "styles";

/// Errors that can occur when compiling stylesheets.
#[derive(Debug, Error)]
pub enum StyleError {
    /// The file is not valid UTF-8.
    #[error("{0} is not valid UTF-8")]
    Encoding(Utf8PathBuf),

    /// A Sass compilation error occurred.
    #[error("Sass compilation error in {0}:\n{1}")]
    Sass(Utf8PathBuf, Box<grass::Error>),
}

/// Compiles the entry stylesheets of the styles root to CSS.
///
/// Entries are the top level `.scss` files not starting with `_`. Partials
/// are not compiled on their own, but a change to any `.scss` file under the
/// root rebuilds every entry, since any of them may import it.
pub fn register(blueprint: &mut Blueprint) -> Result<TaskId, GraphError> {
    let root = blueprint.config().sources.styles.clone();

    blueprint
        .task(TASK)
        .source(glob_under(&root, "[!_]*.scss"))
        .watch(glob_under(&root, "**/*.scss"))
        .run(|ctx, inputs| {
            let load_path = ctx.env.root().join(&ctx.env.config.sources.styles);

            let mut outputs = Vec::with_capacity(inputs.files.len());
            for file in &inputs.files {
                let text = std::str::from_utf8(&file.data)
                    .map_err(|_| StyleError::Encoding(file.path.clone()))?;

                let css = compile(&file.path, text, &load_path)?;
                let stem = file.path.file_stem().unwrap_or("style");
                outputs.push(Output::text(format!("css/{stem}.css"), css));
            }

            Ok(outputs)
        })
}

/// Compile one SCSS source into compressed CSS, resolving imports against
/// `load_path`.
pub fn compile(path: &Utf8Path, scss: &str, load_path: &Utf8Path) -> Result<String, StyleError> {
    let options = grass::Options::default()
        .load_path(load_path)
        .style(grass::OutputStyle::Compressed);

    grass::from_string(scss, &options).map_err(|e| StyleError::Sass(path.to_owned(), e))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn compiles_with_partials_from_the_load_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("_vars.scss"), "$accent: red;").unwrap();

        let css = compile(
            Utf8Path::new("main.scss"),
            "@import \"vars\";\n.btn { color: $accent; }",
            root,
        )
        .unwrap();

        assert!(css.contains(".btn{color:red}"));
    }

    #[test]
    fn syntax_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        let err = compile(Utf8Path::new("src/scss/main.scss"), ".btn { color: $missing; }", root)
            .unwrap_err();
        assert!(err.to_string().contains("src/scss/main.scss"));
    }
}
