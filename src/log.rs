use backtrace::Backtrace;
use nix::errno::{errno, Errno};
use std::{
    fs::File,
    io::{self, Result, Write},
    os::unix::io::{FromRawFd, RawFd},
    sync::{Mutex, MutexGuard},
};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level: LogLevel,
    /// Owned sink handed over by the controller. `None` falls back to
    /// stderr, which is what we have before the argument record is read
    /// and after `close()`.
    sink: Option<Box<dyn Write + Send>>,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = Mutex::new(LogGlobals {
        level: LogWarn,
        sink: None,
    });
}

/// Take ownership of the controller-supplied log descriptor. A negative fd
/// means "keep logging to stderr".
pub fn set_fd(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let f = unsafe { File::from_raw_fd(fd) };
    let mut lock = LOG_GLOBALS.lock().unwrap();
    lock.sink = Some(Box::new(f));
}

/// The controller sends its own numeric verbosity; clamp it onto our levels.
pub fn set_level(raw: u32) {
    let level = match raw {
        0 | 1 => LogError,
        2 => LogWarn,
        3 => LogInfo,
        _ => LogDebug,
    };
    LOG_GLOBALS.lock().unwrap().level = level;
}

/// Flush and drop the log sink, closing the underlying descriptor. Strict
/// seccomp forbids close(), so this must run before the filter is installed.
pub fn close() {
    let mut lock = LOG_GLOBALS.lock().unwrap();
    if let Some(mut sink) = lock.sink.take() {
        sink.flush().unwrap_or(());
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(level: LogLevel, filename: &str, line: u32) -> Option<NewLineTerminatingOstream> {
        let lock = LOG_GLOBALS.lock().unwrap();
        if level > lock.level {
            return None;
        }
        let mut stream = NewLineTerminatingOstream {
            message: Vec::new(),
            lock,
        };
        write_prefix(&mut stream, level, filename, line);
        Some(stream)
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        self.message.push(b'\n');
        self.flush().unwrap_or(());
    }
}

impl Write for NewLineTerminatingOstream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.message.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Write the accumulated `message` to the sink (or stderr if the
    /// controller gave us none, or it was already closed).
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() {
            match &mut self.lock.sink {
                Some(sink) => sink.write_all(&self.message)?,
                None => io::stderr().write_all(&self.message)?,
            }
        }
        self.message.clear();
        Ok(())
    }
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap();

    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", Errno::from_i32(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

/// Almost always not the function you want; use the log!() macro.
pub fn log(level: LogLevel, filename: &str, line: u32) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(level, filename, line)
}

/// Leveled output to the controller-supplied descriptor (or stderr).
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = crate::log::log($log_level, file!(), line!());
            match maybe_stream {
                Some(mut stream) => write!(stream, $($args)+).unwrap(),
                None => (),
            }
        }
    };
}

/// For internal engine bugs only -- restore failures go through
/// `RestoreError` and the abort futex instead. Logs, dumps a backtrace to
/// stderr and aborts the process.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(LogFatal, file!(), line!());
                match maybe_stream {
                    Some(mut stream) => write!(stream, $($args)+).unwrap(),
                    None => (),
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    close();
    eprintln!("=== Start revive backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End revive backtrace");
    std::process::abort();
}
