//! Diagnostics channel for the state machine. Unhandled or malformed
//! sequences end up here; a granted DEBUG subwindow streams the backlog.

use std::collections::VecDeque;

use super::surface::Surface;

const BACKLOG: usize = 256;

#[derive(Default)]
pub struct DebugLog {
    lines: VecDeque<String>,
    counter: u64,
}

impl DebugLog {
    pub fn record(&mut self, line: String) {
        log::debug!("vt: {}", line);
        if self.lines.len() == BACKLOG {
            self.lines.pop_front();
        }
        self.counter += 1;
        self.lines.push_back(format!("{}: {}", self.counter, line));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Render the backlog plus a state summary for the debug window,
    /// consuming the backlog.
    pub fn render(&mut self, surf: &Surface) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "dims {}x{} cursor {},{} alt:{} wrap:{} mouse:{:?}\n",
            surf.cols,
            surf.rows,
            surf.cursor_x,
            surf.cursor_y,
            surf.in_alt_screen,
            surf.auto_wrap,
            surf.mouse,
        ));
        for line in self.lines.drain(..) {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vt::surface::Surface;

    #[test]
    fn backlog_is_bounded() {
        let mut log = DebugLog::default();
        for i in 0..BACKLOG + 10 {
            log.record(format!("line {}", i));
        }
        assert_eq!(log.len(), BACKLOG);
    }

    #[test]
    fn render_drains_and_prefixes_state() {
        let mut log = DebugLog::default();
        log.record("unhandled OSC command (PS: 4)".into());
        let surf = Surface::new(80, 24, [255, 255, 255], [0, 0, 0]);
        let out = log.render(&surf);
        assert!(out.starts_with("dims 80x24"));
        assert!(out.contains("unhandled OSC command"));
        assert!(log.is_empty());
    }
}
