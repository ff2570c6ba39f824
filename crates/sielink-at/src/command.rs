//! AT command and response records.
//!
//! An [`AtCommand`] describes one command/response transaction: the text
//! to send, how the channel should classify the reply lines, and how long
//! to wait. The channel executes exactly one command at a time; additional
//! sends queue behind the current one.

use std::time::Duration;

/// How the channel matches response lines to the current command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCommandKind {
    /// Accept response lines that do not look unsolicited.
    Default,
    /// First line must match the prefix; later non-status lines join it
    /// with CRLF. Unsolicited-looking lines are ejected.
    Multiline,
    /// Accept only lines beginning with the expected prefix; everything
    /// else goes to the unsolicited path.
    PrefixFiltered,
    /// Accept lines not starting with `+`, `*`, `^`, `!`.
    NoPrefix,
    /// Accept all lines, and also fan them out to the unsolicited path.
    NoPrefixAll,
    /// A fixed-size binary payload is consumed from the raw byte stream
    /// first; afterwards the channel waits for the final status line only.
    Binary,
    /// Accept lines starting with the prefix (if any) or a decimal digit.
    Numeric,
    /// A dial command: `CONNECT` is a success status and the `NO …`
    /// family are error statuses.
    Dial,
    /// No response lines expected; only the status line.
    NoResponse,
}

/// One AT command to execute.
#[derive(Debug, Clone)]
pub struct AtCommand {
    /// Command text without the trailing CR (appended on send).
    pub text: String,
    /// Line-dispatch rule for the reply.
    pub kind: AtCommandKind,
    /// Expected response prefix for the prefix-driven kinds.
    pub prefix: String,
    /// Overall transaction timeout; also bounds each line wait.
    pub timeout: Duration,
    /// Size of the raw payload for [`AtCommandKind::Binary`].
    pub binary_size: usize,
}

impl AtCommand {
    /// Default transaction timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// A command with the default kind and timeout.
    pub fn new(text: impl Into<String>) -> Self {
        AtCommand {
            text: text.into(),
            kind: AtCommandKind::Default,
            prefix: String::new(),
            timeout: Self::DEFAULT_TIMEOUT,
            binary_size: 0,
        }
    }

    /// Set the dispatch kind.
    pub fn kind(mut self, kind: AtCommandKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the expected response prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the transaction timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Make this a binary command expecting `size` raw payload bytes.
    pub fn binary(mut self, size: usize) -> Self {
        self.kind = AtCommandKind::Binary;
        self.binary_size = size;
        self
    }
}

/// Terminal status of an AT transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtStatus {
    /// `OK`.
    Ok,
    /// `CONNECT` (dial commands only).
    Connect,
    /// `ERROR`.
    Error,
    /// `+CMS ERROR: …` with the message text.
    CmsError(String),
    /// `+CME ERROR: …` with the message text.
    CmeError(String),
    /// `NO CARRIER` (dial commands only).
    NoCarrier,
    /// `NO ANSWER` (dial commands only).
    NoAnswer,
    /// `NO DIALTONE` (dial commands only).
    NoDialtone,
    /// No terminal status arrived within the command timeout.
    Timeout,
    /// The serial port closed mid-transaction.
    PortClosed,
}

impl AtStatus {
    /// Classify a line as a terminal status, if it is one.
    pub fn from_line(line: &str, dial: bool) -> Option<AtStatus> {
        if line == "OK" {
            return Some(AtStatus::Ok);
        }
        if line == "ERROR" || line.starts_with("ERROR:") {
            return Some(AtStatus::Error);
        }
        if let Some(rest) = line.strip_prefix("+CMS ERROR:") {
            return Some(AtStatus::CmsError(rest.trim().to_string()));
        }
        if let Some(rest) = line.strip_prefix("+CME ERROR:") {
            return Some(AtStatus::CmeError(rest.trim().to_string()));
        }
        if dial {
            if line.starts_with("CONNECT") {
                return Some(AtStatus::Connect);
            }
            match line {
                "NO CARRIER" => return Some(AtStatus::NoCarrier),
                "NO ANSWER" => return Some(AtStatus::NoAnswer),
                "NO DIALTONE" => return Some(AtStatus::NoDialtone),
                _ => {}
            }
        }
        None
    }

    /// `true` for the success statuses (`OK`, `CONNECT`).
    pub fn is_success(&self) -> bool {
        matches!(self, AtStatus::Ok | AtStatus::Connect)
    }
}

/// The assembled result of one AT transaction.
#[derive(Debug, Clone)]
pub struct AtResponse {
    /// `true` when the terminal status was a success.
    pub success: bool,
    /// The terminal status.
    pub status: AtStatus,
    /// Accepted non-status lines, in arrival order.
    pub lines: Vec<String>,
    /// The raw payload for binary commands.
    pub binary: Option<Vec<u8>>,
}

impl AtResponse {
    pub(crate) fn finish(status: AtStatus, lines: Vec<String>, binary: Option<Vec<u8>>) -> Self {
        AtResponse {
            success: status.is_success(),
            status,
            lines,
            binary,
        }
    }

    /// The first accepted line, or an empty string.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    /// Convert a failed transaction into the matching error.
    pub fn ensure_success(self) -> sielink_core::Result<AtResponse> {
        use sielink_core::Error;
        match self.status {
            _ if self.success => Ok(self),
            AtStatus::Timeout => Err(Error::Timeout),
            AtStatus::PortClosed => Err(Error::ConnectionLost),
            status => Err(Error::Protocol(format!("AT command failed: {status:?}"))),
        }
    }
}

/// Whether a line looks like an unsolicited report rather than a command
/// response (`+CREG: …`, `^SYSSTART`, `*PSUTTZ`, `!BOOT`).
pub(crate) fn looks_unsolicited(line: &str) -> bool {
    matches!(line.bytes().next(), Some(b'+' | b'*' | b'^' | b'!'))
}
