//! Error types for the speed test.
//!
//! Every failure that can reach the caller carries an [`ErrorKind`] from a
//! closed set, a user-facing message and, where it helps, a suggestion.
//! Per-probe and per-connection failures never surface here; they are folded
//! into statistics by the latency prober and the bandwidth meter.

use std::error::Error;
use std::fmt;

/// Exit codes for the application.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Network error (connection failed, timeout, etc.).
    pub const NETWORK_ERROR: i32 = 1;
    /// Target discovery failed.
    pub const DISCOVERY_ERROR: i32 = 2;
    /// Configuration error (invalid arguments, empty target set).
    pub const CONFIG_ERROR: i32 = 3;
    /// Partial failure (some phases failed but others succeeded).
    pub const PARTIAL_FAILURE: i32 = 4;
    /// The forced IP protocol is not usable on this network.
    pub const PROTOCOL_ERROR: i32 = 5;
    /// Interrupted by the user.
    pub const INTERRUPTED: i32 = 130;
    /// Unknown/unexpected error.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur during a speed test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller supplied an empty target set.
    NoUrlsProvided,
    /// The protocol probe domain could not be resolved at all.
    ProtocolResolutionFailed,
    /// The probe domain resolved, but not to an address of the forced family.
    NoAddressForProtocol,
    /// The request over the forced family could not be completed.
    ProtocolConnectivityFailed,
    /// The request over the forced family returned a non-success status.
    ProtocolTestFailed,
    /// A connection target has no address of the forced family.
    NoAddressForForcedProtocol,
    /// A probe exceeded its time budget.
    ConnectionTimeout,
    /// Every download transfer failed.
    DownloadTestFailed,
    /// Every upload transfer failed.
    UploadTestFailed,
    /// Test target discovery failed.
    Discovery,
    /// DNS resolution failures.
    Dns,
    /// Connection timeout outside of a probe.
    Timeout,
    /// TLS/SSL handshake failures.
    Tls,
    /// Network connectivity issues.
    Network,
    /// Invalid configuration or arguments.
    Config,
    /// The user interrupted the run.
    Interrupted,
    /// Unknown or unexpected errors.
    Unknown,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::NoUrlsProvided | ErrorKind::Config => {
                exit_codes::CONFIG_ERROR
            }
            ErrorKind::ProtocolResolutionFailed
            | ErrorKind::NoAddressForProtocol
            | ErrorKind::ProtocolConnectivityFailed
            | ErrorKind::ProtocolTestFailed
            | ErrorKind::NoAddressForForcedProtocol => exit_codes::PROTOCOL_ERROR,
            ErrorKind::ConnectionTimeout
            | ErrorKind::DownloadTestFailed
            | ErrorKind::UploadTestFailed
            | ErrorKind::Dns
            | ErrorKind::Timeout
            | ErrorKind::Tls
            | ErrorKind::Network => exit_codes::NETWORK_ERROR,
            ErrorKind::Discovery => exit_codes::DISCOVERY_ERROR,
            ErrorKind::Interrupted => exit_codes::INTERRUPTED,
            ErrorKind::Unknown => exit_codes::UNKNOWN_ERROR,
        }
    }

    /// Whether this kind reports an unusable forced protocol.
    pub fn is_protocol_error(&self) -> bool {
        self.exit_code() == exit_codes::PROTOCOL_ERROR
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::NoUrlsProvided => "No test URLs provided",
            ErrorKind::ProtocolResolutionFailed => "Protocol resolution failed",
            ErrorKind::NoAddressForProtocol => "No address for protocol",
            ErrorKind::ProtocolConnectivityFailed => {
                "Protocol connectivity failed"
            }
            ErrorKind::ProtocolTestFailed => "Protocol test failed",
            ErrorKind::NoAddressForForcedProtocol => {
                "No address for forced protocol"
            }
            ErrorKind::ConnectionTimeout => "Connection timeout",
            ErrorKind::DownloadTestFailed => "Download test failed",
            ErrorKind::UploadTestFailed => "Upload test failed",
            ErrorKind::Discovery => "Server discovery error",
            ErrorKind::Dns => "DNS resolution error",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Tls => "TLS/SSL error",
            ErrorKind::Network => "Network error",
            ErrorKind::Config => "Configuration error",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::Unknown => "Unknown error",
        }
    }
}

/// A user-friendly error type for speed test operations.
#[derive(Debug)]
pub struct SpeedTestError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// User-friendly error message.
    pub message: String,
    /// Optional suggestion for how to resolve the error.
    pub suggestion: Option<String>,
    /// The underlying error, if any.
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl SpeedTestError {
    /// Create a new SpeedTestError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), suggestion: None, source: None }
    }

    /// Add a suggestion for how to resolve the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add the underlying error source.
    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn no_urls() -> Self {
        Self::new(ErrorKind::NoUrlsProvided, "the list of test URLs is empty")
            .with_suggestion("Pass at least one --url or let discovery run.")
    }

    /// Create a protocol error of the given kind.
    pub fn protocol(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message).with_suggestion(
            "Your network may not support this IP version. Try --protocol auto.",
        )
    }

    pub fn forced_family(host: &str, family: &str) -> Self {
        Self::protocol(
            ErrorKind::NoAddressForForcedProtocol,
            format!("{} has no {} address", host, family),
        )
    }

    pub fn probe_timeout(elapsed_ms: f64, limit_ms: u64) -> Self {
        Self::new(
            ErrorKind::ConnectionTimeout,
            format!("probe took {:.1} ms, limit is {} ms", elapsed_ms, limit_ms),
        )
    }

    pub fn download_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DownloadTestFailed, message)
            .with_suggestion("Check your internet connection and try again.")
    }

    pub fn upload_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UploadTestFailed, message)
            .with_suggestion("Check your internet connection and try again.")
    }

    /// Create a discovery error.
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Discovery, message).with_suggestion(
            "fast.com may be unreachable. Try again later or pass --url.",
        )
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
            .with_suggestion("Check your internet connection and try again.")
    }

    /// Create a DNS error.
    pub fn dns(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dns, message).with_suggestion(
            "Check your DNS settings or try using a different DNS server.",
        )
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted, "the run was stopped before it finished")
    }
}

impl fmt::Display for SpeedTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)?;

        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl Error for SpeedTestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Classify a foreign error into an ErrorKind based on its message chain.
pub fn classify_error(error: &dyn Error) -> ErrorKind {
    let mut error_str = error.to_string().to_lowercase();
    let mut source = error.source();
    while let Some(inner) = source {
        error_str.push(' ');
        error_str.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }

    if error_str.contains("dns")
        || error_str.contains("resolve")
        || error_str.contains("no such host")
    {
        return ErrorKind::Dns;
    }

    if error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("deadline")
    {
        return ErrorKind::Timeout;
    }

    if error_str.contains("tls")
        || error_str.contains("ssl")
        || error_str.contains("certificate")
        || error_str.contains("handshake")
    {
        return ErrorKind::Tls;
    }

    if error_str.contains("connection refused")
        || error_str.contains("connection reset")
        || error_str.contains("network unreachable")
        || error_str.contains("host unreachable")
        || error_str.contains("no route")
        || error_str.contains("broken pipe")
        || error_str.contains("error sending request")
    {
        return ErrorKind::Network;
    }

    ErrorKind::Unknown
}

/// The protocol error kind carried anywhere in `error`'s source chain.
///
/// Forced-family failures raised inside the DNS resolver reach callers
/// wrapped in HTTP client errors; this recovers them.
pub fn protocol_error_kind(error: &(dyn Error + 'static)) -> Option<ErrorKind> {
    let mut current = Some(error);
    while let Some(inner) = current {
        if let Some(ours) = inner.downcast_ref::<SpeedTestError>() {
            if ours.kind.is_protocol_error() {
                return Some(ours.kind);
            }
        }
        current = inner.source();
    }
    None
}

/// Format an error for user display.
///
/// This function creates a user-friendly error message that includes
/// the error description and any available suggestions.
pub fn format_error_for_display(error: &SpeedTestError) -> String {
    let mut output =
        format!("Error: {}: {}", error.kind.description(), error.message);

    if let Some(ref suggestion) = error.suggestion {
        output.push_str(&format!("\n\nSuggestion: {}", suggestion));
    }

    output
}
