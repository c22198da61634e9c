use crossterm::style::Stylize;
use std::io::{self, Stdout, Write};

use super::format::{format_hop, format_retry, format_trace_line};
use super::{OutputSink, TargetHeader};
use crate::engine::{EngineError, HopRecord};

/// Writes hops to a terminal (or any writer) as soon as they arrive
pub struct TerminalSink<W: Write + Send> {
    out: W,
    color: bool,
}

impl TerminalSink<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout(), true)
    }
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> OutputSink for TerminalSink<W> {
    fn begin(&mut self, header: &TargetHeader) -> io::Result<()> {
        let title = format!("『{}』", header.label);
        if self.color {
            writeln!(self.out, "{}", title.yellow().bold())?;
        } else {
            writeln!(self.out, "{}", title)?;
        }
        writeln!(self.out, "{}", format_trace_line(header))?;
        self.out.flush()
    }

    fn render(&mut self, hop: &HopRecord) -> io::Result<()> {
        writeln!(self.out, "{}", format_hop(hop))?;
        self.out.flush()
    }

    fn retry(&mut self, attempt: u8, error: &EngineError) -> io::Result<()> {
        let marker = format_retry(attempt, error);
        if self.color {
            writeln!(self.out, "{}", marker.dark_yellow())?;
        } else {
            writeln!(self.out, "{}", marker)?;
        }
        self.out.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
