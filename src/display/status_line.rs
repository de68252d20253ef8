//! A single self-overwriting status line.

use crate::display::DisplayMode;
use crate::speedtest::progress::{ProgressCallback, ProgressEvent, TestPhase};
use crate::speedtest::Direction;
use crossterm::{
    cursor::MoveToColumn,
    execute,
    style::Print,
    terminal::{Clear, ClearType},
};
use std::io::{self, Write};
use std::sync::Mutex;

/// Draws progress events as one line that is rewritten in place.
///
/// Outside [`DisplayMode::Interactive`] every event is ignored.
pub struct StatusLine {
    mode: DisplayMode,
    // Serialises writes from concurrent callers.
    drawn: Mutex<bool>,
}

impl StatusLine {
    pub fn new(mode: DisplayMode) -> Self {
        Self { mode, drawn: Mutex::new(false) }
    }

    /// Wipe the line so the summary starts on a clean row.
    pub fn clear(&self) -> io::Result<()> {
        if self.mode != DisplayMode::Interactive {
            return Ok(());
        }

        let Ok(mut drawn) = self.drawn.lock() else {
            return Ok(());
        };
        if *drawn {
            let mut stdout = io::stdout();
            execute!(stdout, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
            *drawn = false;
        }

        Ok(())
    }

    fn draw(&self, text: &str) -> io::Result<()> {
        let Ok(mut drawn) = self.drawn.lock() else {
            return Ok(());
        };

        let mut stdout = io::stdout();
        execute!(
            stdout,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(text)
        )?;
        stdout.flush()?;
        *drawn = true;

        Ok(())
    }
}

impl ProgressCallback for StatusLine {
    fn on_progress(&self, event: ProgressEvent) {
        if self.mode != DisplayMode::Interactive {
            return;
        }

        let result = match status_text(&event) {
            Some(text) => self.draw(&text),
            None => self.clear(),
        };

        if let Err(e) = result {
            log::debug!("Status line write failed: {}", e);
        }
    }
}

fn phase_label(phase: TestPhase) -> &'static str {
    match phase {
        TestPhase::Protocol => "Checking protocol",
        TestPhase::Discovery => "Finding servers",
        TestPhase::Latency => "Measuring latency",
        TestPhase::Download => "Measuring download",
        TestPhase::Upload => "Measuring upload",
        TestPhase::Complete => "Done",
    }
}

/// The line shown for `event`, or `None` when the line should be cleared.
pub fn status_text(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::PhaseChange(TestPhase::Complete) => None,
        ProgressEvent::PhaseChange(phase) => Some(format!("{}...", phase_label(*phase))),
        ProgressEvent::LatencyProbe { latency_ms, current, total } => {
            let value = match latency_ms {
                Some(latency_ms) => format!("{:.1} ms", latency_ms),
                None => String::from("lost"),
            };
            Some(format!("Latency probe {}/{}: {}", current, total, value))
        }
        ProgressEvent::Throughput { direction, speed, elapsed } => {
            let phase = match direction {
                Direction::Download => TestPhase::Download,
                Direction::Upload => TestPhase::Upload,
            };
            Some(format!("{} {} ({:.1}s)", phase_label(phase), speed, elapsed.as_secs_f64()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{SpeedMeasurement, SpeedUnit};
    use std::time::Duration;

    #[test]
    fn test_status_text() {
        assert_eq!(
            status_text(&ProgressEvent::PhaseChange(TestPhase::Latency)).as_deref(),
            Some("Measuring latency...")
        );
        assert_eq!(
            status_text(&ProgressEvent::LatencyProbe {
                latency_ms: Some(12.34),
                current: 3,
                total: 10
            })
            .as_deref(),
            Some("Latency probe 3/10: 12.3 ms")
        );
        assert_eq!(
            status_text(&ProgressEvent::LatencyProbe { latency_ms: None, current: 4, total: 10 })
                .as_deref(),
            Some("Latency probe 4/10: lost")
        );
        assert_eq!(
            status_text(&ProgressEvent::Throughput {
                direction: Direction::Upload,
                speed: SpeedMeasurement::new(48.26, SpeedUnit::Mbps),
                elapsed: Duration::from_millis(6_000),
            })
            .as_deref(),
            Some("Measuring upload 48.3 Mbps (6.0s)")
        );
    }

    #[test]
    fn test_complete_clears_the_line() {
        assert_eq!(status_text(&ProgressEvent::PhaseChange(TestPhase::Complete)), None);
    }

    #[test]
    fn test_non_interactive_modes_draw_nothing() {
        let line = StatusLine::new(DisplayMode::Silent);
        line.on_progress(ProgressEvent::PhaseChange(TestPhase::Download));
        assert!(!*line.drawn.lock().unwrap());
        assert!(line.clear().is_ok());
    }
}
