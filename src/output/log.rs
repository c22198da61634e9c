use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::format::{format_hop, format_retry, format_trace_line};
use super::{OutputSink, TargetHeader, TerminalSink};
use crate::engine::{EngineError, HopRecord};

/// Appends plain-text hop records to the trace log.
///
/// The handle lives for one target only; `finish` flushes and closes it.
/// With an echo attached, target headers are also shown on the terminal so
/// a logging run still says what it is tracing.
pub struct LogSink {
    file: Option<BufWriter<File>>,
    echo: Option<TerminalSink<Box<dyn Write + Send>>>,
}

impl LogSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
            echo: None,
        })
    }

    /// Also write each target header to `out`
    pub fn with_echo(mut self, out: impl Write + Send + 'static, color: bool) -> Self {
        self.echo = Some(TerminalSink::new(Box::new(out), color));
        self
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("trace log already closed"))
    }
}

impl OutputSink for LogSink {
    fn begin(&mut self, header: &TargetHeader) -> io::Result<()> {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let out = self.writer()?;
        writeln!(out, "[{}] 『{}』", stamp, header.label)?;
        writeln!(out, "{}", format_trace_line(header))?;
        out.flush()?;
        match self.echo {
            Some(ref mut echo) => echo.begin(header),
            None => Ok(()),
        }
    }

    fn render(&mut self, hop: &HopRecord) -> io::Result<()> {
        let out = self.writer()?;
        writeln!(out, "{}", format_hop(hop))?;
        // Keep finished hops on disk even if a later target crashes the run
        out.flush()
    }

    fn retry(&mut self, attempt: u8, error: &EngineError) -> io::Result<()> {
        let out = self.writer()?;
        writeln!(out, "{}", format_retry(attempt, error))?;
        out.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(mut out) = self.file.take() {
            writeln!(out)?;
            out.flush()?;
        }
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}
