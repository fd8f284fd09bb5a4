//! Injection of asset references into HTML pages.
//!
//! Pages mark where references go with comment blocks:
//!
//! ```html
//! <head>
//!     <!-- inject:css -->
//!     <!-- endinject -->
//! </head>
//! ```
//!
//! Everything between the markers is replaced with one tag per generated
//! asset, in path order. The markers stay, so injecting is repeatable.

use crate::assets::{pages, scripts, styles};
use crate::blueprint::Blueprint;
use crate::core::TaskId;
use crate::error::GraphError;
use crate::output::Output;

pub const TASK: &str = "inject";

const END_MARKER: &str = "<!-- endinject -->";

pub fn register(blueprint: &mut Blueprint) -> Result<TaskId, GraphError> {
    blueprint
        .task(TASK)
        .depends_on([styles::TASK, scripts::TASK, pages::TASK])
        .run(|ctx, inputs| {
            let css = paths_of(inputs.upstream(styles::TASK), ".css");
            let js = paths_of(inputs.upstream(scripts::TASK), ".js");
            let reload = ctx.env.get_refresh_script();

            let links: Vec<String> = css
                .iter()
                .map(|path| format!(r#"<link rel="stylesheet" href="{path}">"#))
                .collect();

            let scripts: Vec<String> = js
                .iter()
                .map(|path| format!(r#"<script src="{path}"></script>"#))
                .collect();

            let mut outputs = Vec::new();
            for page in inputs.upstream(pages::TASK) {
                let Some(html) = page.as_str() else {
                    anyhow::bail!("{} is not valid UTF-8", page.path);
                };

                let mut html = inject(html, "css", &links);
                html = inject(&html, "js", &scripts);
                if let Some(script) = &reload {
                    html = append_to_body(&html, script);
                }

                outputs.push(Output::text(&page.path, html));
            }

            Ok(outputs)
        })
}

/// Output paths with the given extension, sorted.
fn paths_of(outputs: &[Output], extension: &str) -> Vec<String> {
    let mut paths: Vec<String> = outputs
        .iter()
        .map(|o| o.path.as_str())
        .filter(|p| p.ends_with(extension))
        .map(String::from)
        .collect();
    paths.sort();
    paths
}

/// Replace the contents of every `<!-- inject:<kind> -->` block with `tags`,
/// one per line at the indentation of the opening marker. A block without a
/// closing marker is left as is.
pub fn inject(html: &str, kind: &str, tags: &[String]) -> String {
    let start_marker = format!("<!-- inject:{kind} -->");

    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find(&start_marker) {
        let body = start + start_marker.len();
        let Some(end) = rest[body..].find(END_MARKER) else {
            break;
        };

        let line = &rest[..start];
        let line = &line[line.rfind('\n').map_or(0, |i| i + 1)..];
        let indent = if line.trim().is_empty() { line } else { "" };

        out.push_str(&rest[..body]);
        for tag in tags {
            out.push('\n');
            out.push_str(indent);
            out.push_str(tag);
        }
        out.push('\n');
        out.push_str(indent);
        out.push_str(END_MARKER);

        rest = &rest[body + end + END_MARKER.len()..];
    }

    out.push_str(rest);
    out
}

/// Insert `snippet` right before the last `</body>`, or at the end when the
/// page has no body tag.
fn append_to_body(html: &str, snippet: &str) -> String {
    match html.rfind("</body>") {
        Some(index) => format!("{}{snippet}\n{}", &html[..index], &html[index..]),
        None => format!("{html}\n{snippet}"),
    }
}
