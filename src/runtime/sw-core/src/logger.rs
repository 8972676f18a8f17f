use crate::thread::thread_name;
use chrono::Local;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fmt::{self, Arguments};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Severity {
    Verbose,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Severity::Verbose => write!(f, "verbose"),
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Clone)]
pub struct LogRecord {
    pub severity: Severity,
    pub crate_name: &'static str,
    pub message: String,
    pub time: chrono::DateTime<Local>,
    pub thread: thread::ThreadId,
}

/// A sink receives every record sent to the global logger, e.g. to print it
/// or to write it to a file.
pub trait Sink: Send + Sync {
    fn log(&self, record: &LogRecord);
}

static SINKS: Lazy<RwLock<Vec<Arc<dyn Sink>>>> = Lazy::new(RwLock::default);

pub fn register_sink(sink: Arc<dyn Sink>) {
    SINKS.write().push(sink);
}

#[doc(hidden)]
pub fn internal_log(severity: Severity, crate_name: &'static str, args: Arguments) {
    let record = LogRecord {
        severity,
        crate_name,
        message: args.to_string(),
        time: Local::now(),
        thread: thread::current().id(),
    };

    for sink in SINKS.read().iter() {
        sink.log(&record);
    }

    if matches!(severity, Severity::Fatal) {
        panic!("{}", record.message);
    }
}

#[macro_export]
macro_rules! sw_verbose {
    ($($arg:tt)*) => ({
        $crate::logger::internal_log($crate::logger::Severity::Verbose, env!("CARGO_PKG_NAME"), format_args!($($arg)*));
    })
}

#[macro_export]
macro_rules! sw_info {
    ($($arg:tt)*) => ({
        $crate::logger::internal_log($crate::logger::Severity::Info, env!("CARGO_PKG_NAME"), format_args!($($arg)*));
    })
}

#[macro_export]
macro_rules! sw_warn {
    ($($arg:tt)*) => ({
        $crate::logger::internal_log($crate::logger::Severity::Warn, env!("CARGO_PKG_NAME"), format_args!($($arg)*));
    })
}

#[macro_export]
macro_rules! sw_error {
    ($($arg:tt)*) => ({
        $crate::logger::internal_log($crate::logger::Severity::Error, env!("CARGO_PKG_NAME"), format_args!($($arg)*));
    })
}

#[macro_export]
macro_rules! sw_fatal {
    ($($arg:tt)*) => ({
        $crate::logger::internal_log($crate::logger::Severity::Fatal, env!("CARGO_PKG_NAME"), format_args!($($arg)*));
        unreachable!();
    })
}

/// Sink printing colored records to stdout.
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {})
    }
}

impl Sink for StdoutSink {
    fn log(&self, record: &LogRecord) {
        let mut stdout = StandardStream::stdout(ColorChoice::Auto);
        let thread = thread_name(record.thread);
        let thread = thread.as_deref().unwrap_or("<unnamed>");

        let color = match record.severity {
            Severity::Verbose => Color::Cyan,
            Severity::Info => Color::White,
            Severity::Warn => Color::Yellow,
            Severity::Error => Color::Red,
            Severity::Fatal => Color::Magenta,
        };

        if stdout
            .set_color(ColorSpec::new().set_fg(Some(color)))
            .is_err()
        {
            return;
        }

        let _ = writeln!(
            &mut stdout,
            "{} {:>7} [{}] ({}) {}",
            record.time.format("%H:%M:%S%.3f"),
            record.severity,
            thread,
            record.crate_name,
            record.message
        );
        let _ = stdout.flush();
    }
}
