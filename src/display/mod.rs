//! Terminal presentation while a run is in progress.
//!
//! Interactive terminals get a single live status line; pipes get nothing
//! until the final summary, and JSON mode prints only the record.

pub mod display_mode;
pub mod status_line;

pub use display_mode::DisplayMode;
pub use status_line::StatusLine;
