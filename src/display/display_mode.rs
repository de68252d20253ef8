/// How output is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Live status line, then a colored summary
    Interactive,
    /// Colored summary only
    Silent,
    /// The machine-readable record only
    Json,
}

impl DisplayMode {
    /// `--json` always wins; otherwise a terminal on stdout gets the live
    /// status line.
    pub fn detect(json_flag: bool, is_tty: bool) -> Self {
        match (json_flag, is_tty) {
            (true, _) => DisplayMode::Json,
            (false, true) => DisplayMode::Interactive,
            (false, false) => DisplayMode::Silent,
        }
    }

    pub fn is_json(&self) -> bool {
        *self == DisplayMode::Json
    }
}
