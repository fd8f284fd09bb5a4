use camino::{Utf8Path, Utf8PathBuf};
use oxc::allocator::Allocator;
use oxc::codegen::{Codegen, CodegenOptions, CommentOptions};
use oxc::mangler::MangleOptions;
use oxc::minifier::{CompressOptions, Minifier, MinifierOptions};
use oxc::parser::Parser;
use oxc::span::SourceType;
use thiserror::Error;

use crate::assets::glob_under;
use crate::blueprint::Blueprint;
use crate::core::TaskId;
use crate::error::GraphError;
use crate::output::Output;

pub const TASK: &str = "scripts";

/// Errors that can occur when minifying scripts.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{0} is not valid UTF-8")]
    Encoding(Utf8PathBuf),

    /// The parser rejected the source.
    #[error("Couldn't parse {0}:\n{1}")]
    Parse(Utf8PathBuf, String),
}

/// Minifies every script in the scripts root into `js/<stem>.min.js`.
pub fn register(blueprint: &mut Blueprint) -> Result<TaskId, GraphError> {
    let root = blueprint.config().sources.scripts.clone();

    blueprint
        .task(TASK)
        .source(glob_under(&root, "*.js"))
        .run(|_, inputs| {
            let mut outputs = Vec::with_capacity(inputs.files.len());

            for file in &inputs.files {
                let text = std::str::from_utf8(&file.data)
                    .map_err(|_| ScriptError::Encoding(file.path.clone()))?;

                let code = minify(&file.path, text)?;
                let stem = file.path.file_stem().unwrap_or("script");
                outputs.push(Output::text(format!("js/{stem}.min.js"), code));
            }

            Ok(outputs)
        })
}

/// Mangle and compress a classic (non-module) script.
pub fn minify(path: &Utf8Path, source: &str) -> Result<String, ScriptError> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, SourceType::cjs()).parse();

    if !ret.errors.is_empty() {
        let errors = ret
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ScriptError::Parse(path.to_owned(), errors));
    }

    let mut program = ret.program;
    let options = MinifierOptions {
        mangle: Some(MangleOptions::default()),
        compress: Some(CompressOptions::smallest()),
    };

    let ret = Minifier::new(options).minify(&allocator, &mut program);
    let code = Codegen::new()
        .with_options(CodegenOptions {
            minify: true,
            comments: CommentOptions::disabled(),
            ..CodegenOptions::default()
        })
        .with_scoping(ret.scoping)
        .build(&program)
        .code;

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minified_output_is_smaller_and_drops_comments() {
        let source = "// greet the visitor\nfunction greet(visitorName) {\n    console.log('hello ' + visitorName);\n}\ngreet(document.title);\n";
        let code = minify(Utf8Path::new("src/js/app.js"), source).unwrap();

        assert!(code.len() < source.len());
        assert!(!code.contains("greet the visitor"));
        assert!(code.contains("console.log"));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let err = minify(Utf8Path::new("src/js/broken.js"), "function (").unwrap_err();
        assert!(matches!(err, ScriptError::Parse(path, _) if path == "src/js/broken.js"));
    }
}
