//! Line-oriented transports to the stage controller board.
//!
//! The controller speaks a tiny text protocol: one newline-terminated command
//! in (`move_rel A B C`, `fast_move A B C`, `release`), one status line out
//! once the motion has finished.

use std::cell::Cell;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;

use super::controller::MICROSTEPS_PER_STEP;
use super::position::{MotorCommand, Position};

/// Identity reported by an emulated stage.
pub const EMULATED_IDENTITY: &str = "Emulated Stage";

/// Reply an emulated stage sends for every command.
pub const EMULATED_RESPONSE: &str = "emulated";

/// Default serial device of the controller board.
pub const DEFAULT_TTY: &str = "/dev/ttyACM0";

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 9600;

/// How long to wait for a status line; long moves take a while.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("Serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Device closed the connection")]
    Closed,
}

/// A channel that carries one command and returns one status line.
pub trait Transport {
    /// Identity line the device announced when the link was opened.
    fn identity(&self) -> &str;

    /// Send a newline-terminated command and wait for the reply.
    ///
    /// The reply is returned without its line terminator.
    fn query(&mut self, command: &str) -> Result<String, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn identity(&self) -> &str {
        (**self).identity()
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        (**self).query(command)
    }
}

/// Which transport to open. Picked by the caller, never inferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    /// A real controller on a serial port.
    Serial { path: String, baud: u32 },
    /// No hardware: every command is acknowledged synthetically.
    Emulated,
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::Serial {
            path: DEFAULT_TTY.to_string(),
            baud: DEFAULT_BAUD,
        }
    }
}

impl TransportMode {
    /// Open the selected transport.
    ///
    /// A serial port that cannot be opened is an error; falling back to
    /// emulation is the caller's decision.
    pub fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        match self {
            TransportMode::Serial { path, baud } => {
                Ok(Box::new(SerialTransport::open(path, *baud)?))
            }
            TransportMode::Emulated => Ok(Box::new(EmulatedTransport::new())),
        }
    }
}

/// Serial link to the stage controller.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    identity: String,
}

impl SerialTransport {
    /// Open the port and read the start-up identity line.
    ///
    /// The controller prints its firmware version once it is ready to take
    /// commands, so the open blocks until that line arrives.
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        tracing::info!("Opening stage serial port {} at {} bps", path, baud);

        let port = serialport::new(path, baud)
            .timeout(DEFAULT_READ_TIMEOUT)
            .open()
            .map_err(|e| TransportError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let mut transport = Self {
            port,
            identity: String::new(),
        };
        transport.identity = transport.read_line()?;
        tracing::info!("Stage ready: {}", transport.identity);

        Ok(transport)
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte)? {
                0 => return Err(TransportError::Closed),
                _ if byte[0] == b'\n' => break,
                _ => line.push(byte[0]),
            }
        }
        Ok(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
    }
}

impl Transport for SerialTransport {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        // Stale bytes would otherwise be taken as this command's reply
        self.port.clear(ClearBuffer::Input)?;
        self.port.write_all(command.as_bytes())?;
        self.port.flush()?;
        self.read_line()
    }
}

/// Shared cell the emulated stage writes its decoded position into.
pub type PositionFeed = Rc<Cell<Position>>;

/// Stand-in for the controller board when no hardware is attached.
///
/// Every command is acknowledged with [`EMULATED_RESPONSE`] and appended to
/// [`EmulatedTransport::history`]. With a position feed attached, motion
/// commands are decoded back into logical microsteps so a simulated camera
/// can follow the stage.
#[derive(Debug, Default)]
pub struct EmulatedTransport {
    history: Vec<String>,
    feed: Option<PositionFeed>,
}

impl EmulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulate a stage whose physical position is published into `feed`.
    pub fn with_feed(feed: PositionFeed) -> Self {
        Self {
            history: Vec::new(),
            feed: Some(feed),
        }
    }

    /// Commands received so far, without line terminators.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    fn apply_to_feed(&self, command: &str) {
        let Some(feed) = &self.feed else {
            return;
        };
        let mut parts = command.split_whitespace();
        let scale = match parts.next() {
            Some("move_rel") => 1,
            Some("fast_move") => MICROSTEPS_PER_STEP,
            _ => return,
        };
        let args: Vec<i64> = parts.filter_map(|p| p.parse().ok()).collect();
        if let [a, b, c] = args.as_slice() {
            let delta = MotorCommand { a: *a, b: *b, c: *c }.to_logical();
            feed.set(
                feed.get()
                    + Position::new(
                        delta.x.saturating_mul(scale),
                        delta.y.saturating_mul(scale),
                        delta.z.saturating_mul(scale),
                    ),
            );
        }
    }
}

impl Transport for EmulatedTransport {
    fn identity(&self) -> &str {
        EMULATED_IDENTITY
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let command = command.trim_end();
        self.apply_to_feed(command);
        self.history.push(command.to_string());
        Ok(EMULATED_RESPONSE.to_string())
    }
}
