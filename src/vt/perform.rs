//! `vte::Perform` glue between the parser and the surface. Machine
//! responses (DA, DSR) go through the write-back buffer, never straight to
//! the child.

use vte::{Params, Perform};

use super::debug::DebugLog;
use super::palette::Palette;
use super::surface::{CellAttrs, MouseProto, Surface};

pub struct Performer<'a> {
    pub surf: &'a mut Surface,
    pub palette: &'a Palette,
    pub writeback: &'a mut Vec<u8>,
    pub debug: &'a mut DebugLog,
    pub title: &'a mut Option<String>,
}

impl Performer<'_> {
    fn set_sgr(&mut self, params: &[u16]) {
        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => {
                    self.surf.pen_fg = self.surf.default_fg;
                    self.surf.pen_bg = self.surf.default_bg;
                    self.surf.pen_attrs = CellAttrs::empty();
                }
                1 => self.surf.pen_attrs |= CellAttrs::BOLD,
                3 => self.surf.pen_attrs |= CellAttrs::ITALIC,
                4 => self.surf.pen_attrs |= CellAttrs::UNDERLINE,
                7 => self.surf.pen_attrs |= CellAttrs::INVERSE,
                22 => self.surf.pen_attrs -= CellAttrs::BOLD,
                23 => self.surf.pen_attrs -= CellAttrs::ITALIC,
                24 => self.surf.pen_attrs -= CellAttrs::UNDERLINE,
                27 => self.surf.pen_attrs -= CellAttrs::INVERSE,
                30..=37 => self.surf.pen_fg = self.palette.ansi((params[i] - 30) as u8),
                38 => {
                    if let Some((color, skip)) = extended_color(self.palette, &params[i..]) {
                        self.surf.pen_fg = color;
                        i += skip;
                    }
                }
                39 => self.surf.pen_fg = self.surf.default_fg,
                40..=47 => self.surf.pen_bg = self.palette.ansi((params[i] - 40) as u8),
                48 => {
                    if let Some((color, skip)) = extended_color(self.palette, &params[i..]) {
                        self.surf.pen_bg = color;
                        i += skip;
                    }
                }
                49 => self.surf.pen_bg = self.surf.default_bg,
                90..=97 => self.surf.pen_fg = self.palette.ansi((params[i] - 90 + 8) as u8),
                100..=107 => self.surf.pen_bg = self.palette.ansi((params[i] - 100 + 8) as u8),
                other => self.debug.record(format!("unhandled SGR attribute {}", other)),
            }
            i += 1;
        }
    }

    fn dec_private_mode(&mut self, params: &[u16], set: bool) {
        for &mode in params {
            match mode {
                1 => self.surf.app_cursor_keys = set,
                6 => self.surf.origin_mode = set,
                7 => self.surf.auto_wrap = set,
                9 => self.surf.mouse = if set { MouseProto::X10 } else { MouseProto::Off },
                12 => {} // local cursor blink, host-side concern
                25 => self.surf.cursor_visible = set,
                47 | 1047 => {
                    if set {
                        self.surf.enter_alt_screen();
                    } else {
                        self.surf.leave_alt_screen();
                    }
                }
                1049 => {
                    if set {
                        self.surf.save_cursor();
                        self.surf.enter_alt_screen();
                    } else {
                        self.surf.leave_alt_screen();
                        self.surf.restore_cursor();
                    }
                }
                1000 => self.surf.mouse = if set { MouseProto::Normal } else { MouseProto::Off },
                1002 => {
                    self.surf.mouse = if set { MouseProto::ButtonEvent } else { MouseProto::Off }
                }
                1003 => {
                    self.surf.mouse = if set { MouseProto::AnyEvent } else { MouseProto::Off }
                }
                1006 => self.surf.sgr_mouse = set,
                2004 => self.surf.bracketed_paste = set,
                other => self.debug.record(format!("unhandled DEC mode {}", other)),
            }
        }
    }
}

impl Perform for Performer<'_> {
    fn print(&mut self, c: char) {
        self.surf.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x08 => self.surf.backspace(),
            0x09 => self.surf.tab(),
            0x0a | 0x0b | 0x0c => self.surf.newline(),
            0x0d => self.surf.carriage_return(),
            0x07 => {} // BEL
            0x0e | 0x0f => {} // SO/SI charset shifts
            _ => self.debug.record(format!("unhandled C0 byte 0x{:02x}", byte)),
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, action: char) {
        self.debug.record(format!("unhandled DCS hook '{}'", action));
    }

    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        if params.len() < 2 {
            self.debug
                .record(format!("bad OSC sequence, {} part(s)", params.len()));
            return;
        }
        match params[0] {
            // 0, 1, 2: set window title, forwarded to the display identity
            b"0" | b"1" | b"2" => {
                *self.title = Some(String::from_utf8_lossy(params[1]).into_owned());
            }
            // 4: change color, 5: special color, 52: clipboard
            other => {
                self.debug.record(format!(
                    "unhandled OSC command (PS: {})",
                    String::from_utf8_lossy(other)
                ));
            }
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let params: Vec<u16> = params.iter().flat_map(|p| p.iter().copied()).collect();
        let n = params.first().copied().unwrap_or(1).max(1);

        match (action, intermediates) {
            ('A', []) => self.surf.cursor_up(n),
            ('B', []) => self.surf.cursor_down(n),
            ('C', []) => self.surf.cursor_forward(n),
            ('D', []) => self.surf.cursor_backward(n),
            ('E', []) => {
                self.surf.cursor_down(n);
                self.surf.carriage_return();
            }
            ('F', []) => {
                self.surf.cursor_up(n);
                self.surf.carriage_return();
            }
            ('G', []) => {
                let col = n - 1;
                let row = self.surf.cursor_y;
                self.surf.set_cursor_pos(row, col);
            }
            ('H' | 'f', []) => {
                let row = n - 1;
                let col = params.get(1).copied().unwrap_or(1).max(1) - 1;
                self.surf.set_cursor_pos(row, col);
            }
            ('J', []) => self.surf.erase_in_display(params.first().copied().unwrap_or(0)),
            ('K', []) => self.surf.erase_in_line(params.first().copied().unwrap_or(0)),
            ('L', []) => self.surf.insert_lines(n),
            ('M', []) => self.surf.delete_lines(n),
            ('P', []) => self.surf.delete_chars(n),
            ('S', []) => self.surf.scroll_up(n),
            ('T', []) => self.surf.scroll_down(n),
            ('X', []) => self.surf.erase_chars(n),
            ('@', []) => self.surf.insert_chars(n),
            ('d', []) => {
                let row = n - 1;
                let col = self.surf.cursor_x;
                self.surf.set_cursor_pos(row, col);
            }
            ('m', []) => {
                if params.is_empty() {
                    self.set_sgr(&[0]);
                } else {
                    self.set_sgr(&params);
                }
            }
            ('r', []) => {
                let top = n - 1;
                let bottom = params.get(1).copied().unwrap_or(self.surf.rows).max(1) - 1;
                self.surf.set_scroll_region(top, bottom);
            }
            ('s', []) => self.surf.save_cursor(),
            ('u', []) => self.surf.restore_cursor(),
            ('h', [b'?']) => self.dec_private_mode(&params, true),
            ('l', [b'?']) => self.dec_private_mode(&params, false),
            ('h', []) | ('l', []) => {
                for &mode in &params {
                    match mode {
                        4 => self.surf.insert_mode = action == 'h',
                        other => self.debug.record(format!("unhandled ANSI mode {}", other)),
                    }
                }
            }
            ('n', []) => {
                // DSR: cursor position report
                if params.first() == Some(&6) {
                    let row = self.surf.cursor_y + 1;
                    let col = self.surf.cursor_x + 1;
                    self.writeback
                        .extend_from_slice(format!("\x1b[{};{}R", row, col).as_bytes());
                }
            }
            ('c', []) | ('c', [b'?']) => {
                // DA1: identify as VT220-compatible
                self.writeback.extend_from_slice(b"\x1b[?62;22c");
            }
            _ => {
                self.debug.record(format!(
                    "unhandled CSI '{}' params {:?} intermediates {:?}",
                    action, params, intermediates
                ));
            }
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        match (byte, intermediates) {
            (b'M', []) => self.surf.reverse_index(),
            (b'D', []) => self.surf.newline(),
            (b'E', []) => {
                self.surf.newline();
                self.surf.carriage_return();
            }
            (b'7', []) => self.surf.save_cursor(),
            (b'8', []) => self.surf.restore_cursor(),
            (b'c', []) => {
                self.surf.hard_reset();
                self.writeback.clear();
            }
            (b'=' | b'>', []) => {} // keypad modes
            (_, [b'(' | b')']) => {} // charset designation
            _ => {
                self.debug.record(format!(
                    "unhandled ESC 0x{:02x} intermediates {:?}",
                    byte, intermediates
                ));
            }
        }
    }
}

fn extended_color(palette: &Palette, params: &[u16]) -> Option<([u8; 3], usize)> {
    match params.get(1)? {
        5 => {
            let idx = *params.get(2)? as u8;
            Some((palette.indexed_256(idx), 2))
        }
        2 => {
            let r = *params.get(2)? as u8;
            let g = *params.get(3)? as u8;
            let b = *params.get(4)? as u8;
            Some(([r, g, b], 4))
        }
        _ => None,
    }
}
