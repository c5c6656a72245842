//! The virtual-terminal adapter: a narrow wrapper around the `vte` parser
//! and the cell surface it renders into. The fabric lock serializes every
//! entry point in here; callers flush [`Vt::take_writeback`] to the PTY
//! while still inside that lock so child-bound bytes stay ordered.

pub mod debug;
pub mod keys;
pub mod palette;
mod perform;
pub mod surface;

use debug::DebugLog;
use keys::Mods;
use palette::{Palette, Rgb, COLOR_BACKGROUND, COLOR_FOREGROUND};
use perform::Performer;
use surface::Surface;

pub struct Vt {
    parser: vte::Parser,
    pub surface: Surface,
    palette: Palette,
    writeback: Vec<u8>,
    pub debug: DebugLog,
    title: Option<String>,
    buttons_held: u8,
}

impl Vt {
    pub fn new(cols: u16, rows: u16) -> Self {
        let palette = Palette::default();
        let surface = Surface::new(cols, rows, palette.foreground(), palette.background());
        Vt {
            parser: vte::Parser::new(),
            surface,
            palette,
            writeback: Vec::new(),
            debug: DebugLog::default(),
            title: None,
            buttons_held: 0,
        }
    }

    /// Feed child output through the state machine.
    pub fn input(&mut self, bytes: &[u8]) {
        let mut performer = Performer {
            surf: &mut self.surface,
            palette: &self.palette,
            writeback: &mut self.writeback,
            debug: &mut self.debug,
            title: &mut self.title,
        };
        self.parser.advance(&mut performer, bytes);
    }

    /// Bytes the machine wants sent to the child (DA/DSR responses, input
    /// translations). Empties the buffer.
    pub fn take_writeback(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.writeback)
    }

    /// Pending window title from an OSC 0/1/2, if one arrived since the
    /// last call.
    pub fn take_title(&mut self) -> Option<String> {
        self.title.take()
    }

    pub fn keyboard(&mut self, keysym: u32, mods: Mods, _subid: u16) {
        keys::encode_key(&self.surface, keysym, mods, &mut self.writeback);
    }

    /// Absolute mouse position in cells. Relative events never reach here.
    pub fn mouse_motion(&mut self, x: u16, y: u16, mods: Mods) {
        keys::encode_mouse_motion(
            &self.surface,
            x,
            y,
            self.buttons_held != 0,
            mods,
            &mut self.writeback,
        );
    }

    pub fn mouse_button(&mut self, x: u16, y: u16, button: u8, active: bool, mods: Mods) {
        if (1..=3).contains(&button) {
            let bit = 1u8 << (button - 1);
            if active {
                self.buttons_held |= bit;
            } else {
                self.buttons_held &= !bit;
            }
        }
        keys::encode_mouse_button(&self.surface, x, y, button, active, mods, &mut self.writeback);
    }

    /// Paste path: bytes go to the child verbatim, wrapped in the
    /// bracketed-paste markers when the application asked for them.
    pub fn paste(&mut self, bytes: &[u8]) {
        if self.surface.bracketed_paste {
            self.writeback.extend_from_slice(b"\x1b[200~");
            self.writeback.extend_from_slice(bytes);
            self.writeback.extend_from_slice(b"\x1b[201~");
        } else {
            self.writeback.extend_from_slice(bytes);
        }
    }

    pub fn hard_reset(&mut self) {
        self.parser = vte::Parser::new();
        self.surface.hard_reset();
        self.writeback.clear();
        self.title = None;
        self.buttons_held = 0;
    }

    pub fn set_palette(&mut self, name: &str) -> bool {
        match Palette::named(name) {
            Some(palette) => {
                self.palette = palette;
                self.surface
                    .set_defaults(self.palette.foreground(), self.palette.background());
                self.surface.mark_all_dirty();
                true
            }
            None => {
                log::warn!("unknown palette: {}", name);
                false
            }
        }
    }

    pub fn set_color(&mut self, index: u8, rgb: Rgb) -> bool {
        let ok = self.palette.set(index, rgb);
        if ok && (index == COLOR_FOREGROUND || index == COLOR_BACKGROUND) {
            self.surface
                .set_defaults(self.palette.foreground(), self.palette.background());
        }
        ok
    }

    pub fn get_color(&self, slot: u8) -> Option<Rgb> {
        self.palette.get(slot)
    }

    pub fn dimensions(&self) -> (u16, u16) {
        (self.surface.cols, self.surface.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_lands_in_row_zero() {
        let mut vt = Vt::new(80, 24);
        vt.input(b"hello\n");
        assert_eq!(vt.surface.row_text(0), "hello");
        assert_eq!(vt.surface.cursor_y, 1);
    }

    #[test]
    fn csi_colors_resolve_through_palette() {
        let mut vt = Vt::new(80, 24);
        vt.input(b"\x1b[31mred\x1b[0m");
        let cell = &vt.surface.row(0).unwrap()[0];
        assert_eq!(cell.fg, Palette::default().ansi(1));
    }

    #[test]
    fn da1_answers_on_writeback() {
        let mut vt = Vt::new(80, 24);
        vt.input(b"\x1b[c");
        assert_eq!(vt.take_writeback(), b"\x1b[?62;22c");
        assert!(vt.take_writeback().is_empty());
    }

    #[test]
    fn dsr_reports_cursor() {
        let mut vt = Vt::new(80, 24);
        vt.input(b"abc\x1b[6n");
        assert_eq!(vt.take_writeback(), b"\x1b[1;4R");
    }

    #[test]
    fn osc_title_is_latched_once() {
        let mut vt = Vt::new(80, 24);
        vt.input(b"\x1b]0;my title\x07");
        assert_eq!(vt.take_title().as_deref(), Some("my title"));
        assert_eq!(vt.take_title(), None);
    }

    #[test]
    fn osc_color_commands_hit_debug_sink() {
        let mut vt = Vt::new(80, 24);
        assert!(vt.debug.is_empty());
        vt.input(b"\x1b]4;1;rgb:ff/00/00\x07");
        assert!(!vt.debug.is_empty());
        assert!(vt.take_title().is_none());
    }

    #[test]
    fn paste_honors_bracketed_mode() {
        let mut vt = Vt::new(80, 24);
        vt.paste("café".as_bytes());
        assert_eq!(vt.take_writeback(), "café".as_bytes());
        vt.input(b"\x1b[?2004h");
        vt.paste(b"x");
        assert_eq!(vt.take_writeback(), b"\x1b[200~x\x1b[201~");
    }

    #[test]
    fn paste_bytes_arrive_in_order() {
        let mut vt = Vt::new(80, 24);
        let text = "café".as_bytes();
        vt.paste(text);
        let out = vt.take_writeback();
        assert_eq!(out.len(), 5);
        assert_eq!(out, text);
    }

    #[test]
    fn keyboard_goes_through_writeback() {
        let mut vt = Vt::new(80, 24);
        vt.keyboard(keys::SYM_RETURN, Mods::empty(), 0);
        assert_eq!(vt.take_writeback(), b"\r");
    }

    #[test]
    fn mouse_button_tracks_held_state() {
        let mut vt = Vt::new(80, 24);
        vt.input(b"\x1b[?1002h\x1b[?1006h");
        vt.mouse_button(0, 0, 1, true, Mods::empty());
        vt.mouse_motion(1, 0, Mods::empty());
        vt.mouse_button(1, 0, 1, false, Mods::empty());
        let out = vt.take_writeback();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("\x1b[<32;2;1M")); // drag motion reported
    }

    #[test]
    fn hard_reset_clears_everything() {
        let mut vt = Vt::new(80, 24);
        vt.input(b"\x1b]2;t\x07text\x1b[?2004h\x1b[c");
        vt.hard_reset();
        assert_eq!(vt.surface.row_text(0), "");
        assert!(!vt.surface.bracketed_paste);
        assert!(vt.take_writeback().is_empty());
        assert!(vt.take_title().is_none());
    }

    #[test]
    fn set_palette_updates_defaults() {
        let mut vt = Vt::new(80, 24);
        assert!(vt.set_palette("srcery"));
        assert_eq!(vt.surface.default_bg, [0x1c, 0x1b, 0x19]);
        assert!(!vt.set_palette("bogus"));
    }

    #[test]
    fn set_get_color_round_trip() {
        let mut vt = Vt::new(80, 24);
        assert!(vt.set_color(5, [9, 9, 9]));
        assert_eq!(vt.get_color(5), Some([9, 9, 9]));
        assert!(vt.set_color(COLOR_BACKGROUND, [1, 2, 3]));
        assert_eq!(vt.surface.default_bg, [1, 2, 3]);
    }

    #[test]
    fn alt_screen_sequences() {
        let mut vt = Vt::new(80, 24);
        vt.input(b"base");
        vt.input(b"\x1b[?1049h");
        assert!(vt.surface.in_alt_screen);
        vt.input(b"\x1b[?1049l");
        assert!(!vt.surface.in_alt_screen);
        assert_eq!(vt.surface.row_text(0), "base");
    }
}
