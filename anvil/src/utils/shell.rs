use crate::utils::IResult;

use std::fmt;
use std::io::prelude::*;

use termcolor::Color::{Cyan, Green, Red, Yellow};
use termcolor::{self, Color, ColorSpec, StandardStream, WriteColor};

/// An abstraction around console output that remembers preferences for
/// output verbosity and color.
///
/// Verbosity is a small integer: 0 is quiet (failures only), 1 is the
/// default, 2 and 3 add progressively more detail, higher levels are
/// tracing.
pub struct Shell {
    /// Wrapper around stdout/stderr. This helps with supporting sending
    /// output to a memory buffer which is useful for tests.
    output: ShellOut,
    /// How verbose messages should be (0 = quiet).
    verbosity: u32,
    /// Suppress column numbers in location diagnostics.
    no_column: bool,
    /// Suppress line numbers in location diagnostics.
    no_line: bool,
}

/// A `Write`able object, either with or without color support
enum ShellOut {
    /// A plain write object without color support
    Write(Box<dyn Write + Send>),
    /// Color-enabled stdio, with information on whether color should be used
    Stream {
        stdout: StandardStream,
        stderr: StandardStream,
    },
}

impl Shell {
    /// Creates a new shell with 'auto' color and default verbosity.
    pub fn new() -> Shell {
        Shell {
            output: ShellOut::Stream {
                stdout: StandardStream::stdout(auto_color(atty::Stream::Stdout)),
                stderr: StandardStream::stderr(auto_color(atty::Stream::Stderr)),
            },
            verbosity: 1,
            no_column: false,
            no_line: false,
        }
    }

    /// Creates a shell from a plain writable object, with no color.
    pub fn from_write<W: Write + Send + 'static>(out: W) -> Shell {
        Shell {
            output: ShellOut::Write(Box::new(out)),
            verbosity: 1,
            no_column: false,
            no_line: false,
        }
    }

    pub fn verbosity(&self) -> u32 {
        self.verbosity
    }

    pub fn set_verbosity(&mut self, verbosity: u32) {
        self.verbosity = verbosity;
    }

    pub fn set_location_format(&mut self, no_line: bool, no_column: bool) {
        self.no_line = no_line;
        self.no_column = no_column;
    }

    /// Formats a file location honoring the line/column toggles.
    pub fn location(&self, file: &str, line: u64, column: u64) -> String {
        if self.no_line {
            file.to_string()
        } else if self.no_column {
            format!("{}:{}", file, line)
        } else {
            format!("{}:{}:{}", file, line, column)
        }
    }

    /// Prints a red 'error' message. Printed even when quiet.
    pub fn error<T: fmt::Display>(&mut self, message: T) -> IResult<()> {
        self.output.stderr_status("error", Some(&message), Red)
    }

    /// Prints an amber 'warning' message.
    pub fn warn<T: fmt::Display>(&mut self, message: T) -> IResult<()> {
        if self.verbosity == 0 {
            return Ok(());
        }
        self.output.stderr_status("warning", Some(&message), Yellow)
    }

    /// Prints a cyan 'info' message. Used for the "while ..." context
    /// frames that follow an error.
    pub fn info<T: fmt::Display>(&mut self, message: T) -> IResult<()> {
        self.output.stderr_status("info", Some(&message), Cyan)
    }

    /// Shortcut to right-align and color green a status message.
    pub fn status<T, U>(&mut self, status: T, message: U) -> IResult<()>
    where
        T: fmt::Display,
        U: fmt::Display,
    {
        if self.verbosity == 0 {
            return Ok(());
        }
        self.output.stderr_status_justified(&status, Some(&message), Green)
    }

    /// Prints a plain line at the given verbosity level or above.
    pub fn trace<T: fmt::Display>(&mut self, level: u32, message: T) -> IResult<()> {
        if self.verbosity < level {
            return Ok(());
        }
        writeln!(self.err(), "{}", message)?;
        Ok(())
    }

    /// Gets a reference to the underlying stdout writer.
    pub fn out(&mut self) -> &mut dyn Write {
        match &mut self.output {
            ShellOut::Stream { stdout, .. } => stdout,
            ShellOut::Write(w) => w,
        }
    }

    /// Gets a reference to the underlying stderr writer.
    pub fn err(&mut self) -> &mut dyn Write {
        match &mut self.output {
            ShellOut::Stream { stderr, .. } => stderr,
            ShellOut::Write(w) => w,
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellOut {
    /// Prints out a message with a status. The status comes first, and is
    /// bold plus the given color.
    fn stderr_status(
        &mut self,
        status: &str,
        msg: Option<&dyn fmt::Display>,
        color: Color,
    ) -> IResult<()> {
        match *self {
            ShellOut::Stream { ref mut stderr, .. } => {
                stderr.reset()?;
                stderr.set_color(ColorSpec::new().set_bold(true).set_fg(Some(color)))?;
                write!(stderr, "{}:", status)?;
                stderr.reset()?;
                match msg {
                    Some(msg) => writeln!(stderr, " {}", msg)?,
                    None => write!(stderr, " ")?,
                }
            }
            ShellOut::Write(ref mut w) => {
                write!(w, "{}: ", status)?;
                if let Some(m) = msg {
                    writeln!(w, "{}", m)?;
                }
            }
        }
        Ok(())
    }

    /// As above but right-justified to 12 chars.
    fn stderr_status_justified(
        &mut self,
        status: &dyn fmt::Display,
        msg: Option<&dyn fmt::Display>,
        color: Color,
    ) -> IResult<()> {
        match *self {
            ShellOut::Stream { ref mut stderr, .. } => {
                stderr.reset()?;
                stderr.set_color(ColorSpec::new().set_bold(true).set_fg(Some(color)))?;
                write!(stderr, "{:>12}", status)?;
                stderr.reset()?;
                match msg {
                    Some(msg) => writeln!(stderr, " {}", msg)?,
                    None => write!(stderr, " ")?,
                }
            }
            ShellOut::Write(ref mut w) => {
                write!(w, "{:>12}", status)?;
                match msg {
                    Some(msg) => writeln!(w, " {}", msg)?,
                    None => write!(w, " ")?,
                }
            }
        }
        Ok(())
    }
}

fn auto_color(stream: atty::Stream) -> termcolor::ColorChoice {
    if atty::is(stream) {
        termcolor::ColorChoice::Auto
    } else {
        termcolor::ColorChoice::Never
    }
}

impl fmt::Debug for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shell")
            .field("verbosity", &self.verbosity)
            .finish()
    }
}
