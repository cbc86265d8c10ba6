//! Output sinks for pull/build progress and drained container logs.

use std::io::Write;

use crate::engine::LogStream;

/// Receives everything the environment would otherwise print.
pub trait OutputSink: Send + Sync {
    /// One progress line from an image pull or build.
    fn progress(&self, resource: &str, line: &str);

    /// A chunk of drained container log output.
    fn log(&self, container: &str, stream: LogStream, bytes: &[u8]);
}

/// Writes to the host process's stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl OutputSink for StdioSink {
    fn progress(&self, _resource: &str, line: &str) {
        println!("{}", line);
    }

    fn log(&self, _container: &str, stream: LogStream, bytes: &[u8]) {
        // Host stdio write failures are ignored.
        let _ = match stream {
            LogStream::Stdout => std::io::stdout().lock().write_all(bytes),
            LogStream::Stderr => std::io::stderr().lock().write_all(bytes),
        };
    }
}

/// Re-emits output as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn progress(&self, resource: &str, line: &str) {
        tracing::info!(resource, "{}", line);
    }

    fn log(&self, container: &str, stream: LogStream, bytes: &[u8]) {
        for line in String::from_utf8_lossy(bytes).lines() {
            match stream {
                LogStream::Stdout => tracing::info!(container, "{}", line),
                LogStream::Stderr => tracing::warn!(container, "{}", line),
            }
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn progress(&self, _resource: &str, _line: &str) {}

    fn log(&self, _container: &str, _stream: LogStream, _bytes: &[u8]) {}
}
