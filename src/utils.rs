use std::fmt::Display;
use std::fs;
use std::sync::LazyLock;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;
use indicatif::ProgressStyle;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::ClearError;

const ANSI_BLUE: Style = Style::new().blue();

static STYLE_BUILD: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static STYLE_TASK: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("  {spinner:.blue} {msg} [{elapsed}]")
        .expect("Error setting progress bar template")
});

pub(crate) fn style_build() -> ProgressStyle {
    STYLE_BUILD.clone()
}

pub(crate) fn style_task() -> ProgressStyle {
    STYLE_TASK.clone()
}

/// Install the global subscriber: formatted events on stderr, interleaved
/// with the progress bars of running tasks.
///
/// `RUST_LOG` takes precedence over `verbosity` (0 = info, 1 = debug,
/// 2+ = trace). Calling this more than once is harmless.
pub fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let indicatif_layer = IndicatifLayer::new();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .try_init();
}

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Delete `dir` if it exists, then recreate it empty.
pub fn clear_dir(dir: &Utf8Path) -> Result<(), ClearError> {
    if fs::metadata(dir).is_ok() {
        fs::remove_dir_all(dir).map_err(|e| ClearError::Remove(dir.to_owned(), e))?;
    }

    fs::create_dir_all(dir).map_err(|e| ClearError::Create(dir.to_owned(), e))?;
    Ok(())
}

/// Delete `dir` if it exists.
pub fn remove_dir(dir: &Utf8Path) -> Result<(), ClearError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClearError::Remove(dir.to_owned(), e)),
    }
}
