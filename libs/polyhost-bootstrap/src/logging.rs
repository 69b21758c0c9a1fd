//! `tracing` subscriber setup: a console layer plus rotating JSON files routed
//! by target prefix. Levels come from [`LoggingConfig`] sections; `RUST_LOG`,
//! when set, caps both sinks.

use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

// Keeps the non-blocking console worker alive for the process lifetime.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// `None` turns the sink off; unknown names fall back to `info`.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        _ => Some(LevelFilter::INFO),
    }
}

/// Returns true if target == prefix or target starts with "prefix::"
fn matches_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating writers =================

type Rotating = Arc<Mutex<FileRotate<AppendTimestamp>>>;

#[derive(Clone)]
struct FileHandle(Option<Rotating>);

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => file.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => file.lock().flush(),
            None => Ok(()),
        }
    }
}

fn open_rotating(path: &Path, section: &Section) -> std::io::Result<Rotating> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // prefer a file count, else an age limit
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(
            i64::from(section.max_age_days.unwrap_or(1)),
        )),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;
    Ok(Arc::new(Mutex::new(FileRotate::new(
        path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    ))))
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Routes records to the file of the longest matching target prefix, falling
/// back to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<Rotating>,
    by_prefix: Vec<(String, Rotating)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = Self::default();
        for (name, section) in cfg {
            if section.file.trim().is_empty() {
                continue;
            }
            let path = resolve_log_path(&section.file, base_dir);
            let writer = match open_rotating(&path, section) {
                Ok(w) => w,
                Err(e) => {
                    eprintln!("Failed to open log file '{}' for '{}': {}", path.display(), name, e);
                    continue;
                }
            };
            if name == DEFAULT_SECTION {
                router.default = Some(writer);
            } else {
                router.by_prefix.push((name.clone(), writer));
            }
        }
        router
            .by_prefix
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        router
    }

    fn resolve(&self, target: &str) -> Option<Rotating> {
        self.by_prefix
            .iter()
            .find(|(prefix, _)| matches_prefix(target, prefix))
            .map(|(_, w)| w.clone())
            .or_else(|| self.default.clone())
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = FileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        FileHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        FileHandle(self.resolve(meta.target()))
    }
}

// ================= level targets =================

#[derive(Clone, Copy)]
enum Sink {
    Console,
    File,
}

/// Per-target filter of one sink. A section without a file does not feed the file sink.
fn build_targets(cfg: &LoggingConfig, sink: Sink) -> Targets {
    let level_of = |section: &Section| match sink {
        Sink::Console => parse_level(&section.console_level),
        Sink::File if section.file.trim().is_empty() => None,
        Sink::File => parse_level(&section.file_level),
    };

    let default = cfg
        .get(DEFAULT_SECTION)
        .map(|s| level_of(s).unwrap_or(LevelFilter::OFF))
        .unwrap_or(match sink {
            Sink::Console => LevelFilter::INFO,
            Sink::File => LevelFilter::OFF,
        });

    cfg.iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .fold(Targets::new().with_default(default), |targets, (name, section)| {
            match sink {
                Sink::File if section.file.trim().is_empty() => targets,
                _ => targets.with_target(name.clone(), level_of(section).unwrap_or(LevelFilter::OFF)),
            }
        })
}

// ================= public init =================

/// Install the global subscriber. Relative log files resolve against `base_dir`.
///
/// Safe to call more than once; later calls leave the installed subscriber in place.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` before installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env = EnvFilter::try_from_default_env().ok();

    if cfg.is_empty() {
        let console = fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339());
        let _ = Registry::default().with(env).with(console).try_init();
        return;
    }

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);
    let console = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(build_targets(cfg, Sink::Console));

    let router = FileRouter::build(cfg, base_dir);
    let files = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(build_targets(cfg, Sink::File))
    });

    let _ = Registry::default()
        .with(env)
        .with(console)
        .with(files)
        .try_init();
}
