//! Keyboard and mouse translation into the byte sequences the child
//! expects. Keysym values follow the display server's convention (SDL-style
//! symbols, same numbering the host uses for its input events).

use bitflags::bitflags;

use super::surface::{MouseProto, Surface};

pub const SYM_BACKSPACE: u32 = 8;
pub const SYM_TAB: u32 = 9;
pub const SYM_RETURN: u32 = 13;
pub const SYM_ESCAPE: u32 = 27;
pub const SYM_DELETE: u32 = 127;
pub const SYM_UP: u32 = 273;
pub const SYM_DOWN: u32 = 274;
pub const SYM_RIGHT: u32 = 275;
pub const SYM_LEFT: u32 = 276;
pub const SYM_INSERT: u32 = 277;
pub const SYM_HOME: u32 = 278;
pub const SYM_END: u32 = 279;
pub const SYM_PAGEUP: u32 = 280;
pub const SYM_PAGEDOWN: u32 = 281;
pub const SYM_F1: u32 = 282;
pub const SYM_F12: u32 = 293;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Mods: u16 {
        const LSHIFT = 0x0001;
        const RSHIFT = 0x0002;
        const LCTRL = 0x0040;
        const RCTRL = 0x0080;
        const LALT = 0x0100;
        const RALT = 0x0200;
        const LMETA = 0x0400;
        const RMETA = 0x0800;
    }
}

impl Mods {
    pub fn shift(self) -> bool {
        self.intersects(Mods::LSHIFT | Mods::RSHIFT)
    }
    pub fn ctrl(self) -> bool {
        self.intersects(Mods::LCTRL | Mods::RCTRL)
    }
    pub fn alt(self) -> bool {
        self.intersects(Mods::LALT | Mods::RALT)
    }
}

/// Encode one key press. Printable text normally arrives through the
/// dedicated UTF-8 input path; this handles control combinations and the
/// special keys, mirroring what the child expects from an xterm.
pub fn encode_key(surf: &Surface, keysym: u32, mods: Mods, out: &mut Vec<u8>) {
    if mods.alt() {
        out.push(0x1b);
    }

    if mods.ctrl() {
        if let Some(byte) = ctrl_byte(keysym) {
            out.push(byte);
            return;
        }
    }

    match keysym {
        SYM_RETURN => out.push(b'\r'),
        SYM_TAB => {
            if mods.shift() {
                out.extend_from_slice(b"\x1b[Z");
            } else {
                out.push(b'\t');
            }
        }
        SYM_BACKSPACE => out.push(0x7f),
        SYM_ESCAPE => out.push(0x1b),
        SYM_UP | SYM_DOWN | SYM_RIGHT | SYM_LEFT => {
            let ch = match keysym {
                SYM_UP => b'A',
                SYM_DOWN => b'B',
                SYM_RIGHT => b'C',
                _ => b'D',
            };
            if surf.app_cursor_keys && !mods.shift() && !mods.ctrl() {
                out.extend_from_slice(&[0x1b, b'O', ch]);
            } else if mods.shift() || mods.ctrl() {
                let mod_code = 1 + mods.shift() as u8 + 4 * mods.ctrl() as u8;
                out.extend_from_slice(format!("\x1b[1;{}{}", mod_code, ch as char).as_bytes());
            } else {
                out.extend_from_slice(&[0x1b, b'[', ch]);
            }
        }
        SYM_HOME => out.extend_from_slice(if surf.app_cursor_keys { b"\x1bOH" } else { b"\x1b[H" }),
        SYM_END => out.extend_from_slice(if surf.app_cursor_keys { b"\x1bOF" } else { b"\x1b[F" }),
        SYM_INSERT => out.extend_from_slice(b"\x1b[2~"),
        SYM_DELETE => out.extend_from_slice(b"\x1b[3~"),
        SYM_PAGEUP => out.extend_from_slice(b"\x1b[5~"),
        SYM_PAGEDOWN => out.extend_from_slice(b"\x1b[6~"),
        SYM_F1..=SYM_F12 => {
            let n = keysym - SYM_F1;
            match n {
                0..=3 => out.extend_from_slice(&[0x1b, b'O', b'P' + n as u8]),
                // F5.. use the tilde encodings, with the historical gaps
                4 => out.extend_from_slice(b"\x1b[15~"),
                5 => out.extend_from_slice(b"\x1b[17~"),
                6 => out.extend_from_slice(b"\x1b[18~"),
                7 => out.extend_from_slice(b"\x1b[19~"),
                8 => out.extend_from_slice(b"\x1b[20~"),
                9 => out.extend_from_slice(b"\x1b[21~"),
                10 => out.extend_from_slice(b"\x1b[23~"),
                _ => out.extend_from_slice(b"\x1b[24~"),
            }
        }
        // Plain printable symbol delivered through the key path
        0x20..=0x7e => out.push(keysym as u8),
        _ => {
            if mods.alt() {
                out.pop();
            }
        }
    }
}

fn ctrl_byte(keysym: u32) -> Option<u8> {
    match keysym {
        0x20 | 0x32 => Some(0),
        0x61..=0x7a => Some((keysym as u8) & 0x1f), // a..z
        0x41..=0x5a => Some((keysym as u8 + 0x20) & 0x1f),
        0x5b | 0x33 => Some(0x1b),
        0x5c | 0x34 => Some(0x1c),
        0x5d | 0x35 => Some(0x1d),
        0x5e | 0x36 => Some(0x1e),
        0x5f | 0x37 => Some(0x1f),
        0x38 => Some(0x7f),
        _ => None,
    }
}

/// Mouse button numbering as delivered by the display (1 = left).
fn button_code(button: u8) -> Option<u8> {
    match button {
        1 => Some(0),
        2 => Some(1),
        3 => Some(2),
        4 => Some(64), // wheel up
        5 => Some(65), // wheel down
        _ => None,
    }
}

fn mod_bits(mods: Mods) -> u8 {
    let mut v = 0;
    if mods.shift() {
        v |= 4;
    }
    if mods.alt() {
        v |= 8;
    }
    if mods.ctrl() {
        v |= 16;
    }
    v
}

pub fn encode_mouse_button(
    surf: &Surface,
    x: u16,
    y: u16,
    button: u8,
    active: bool,
    mods: Mods,
    out: &mut Vec<u8>,
) {
    if surf.mouse == MouseProto::Off {
        return;
    }
    if surf.mouse == MouseProto::X10 && !active {
        return;
    }
    let Some(code) = button_code(button) else { return };
    if surf.sgr_mouse {
        let end = if active { 'M' } else { 'm' };
        out.extend_from_slice(
            format!("\x1b[<{};{};{}{}", code | mod_bits(mods), x + 1, y + 1, end).as_bytes(),
        );
    } else {
        let code = if active { code | mod_bits(mods) } else { 3 };
        // Legacy encoding saturates at coordinate 223
        let cx = (x + 1).min(223) as u8;
        let cy = (y + 1).min(223) as u8;
        out.extend_from_slice(&[0x1b, b'[', b'M', 32 + code, 32 + cx, 32 + cy]);
    }
}

pub fn encode_mouse_motion(
    surf: &Surface,
    x: u16,
    y: u16,
    buttons_held: bool,
    mods: Mods,
    out: &mut Vec<u8>,
) {
    let report = match surf.mouse {
        MouseProto::AnyEvent => true,
        MouseProto::ButtonEvent => buttons_held,
        _ => false,
    };
    if !report {
        return;
    }
    let base: u8 = if buttons_held { 0 } else { 3 };
    let code = 32 + (base | mod_bits(mods));
    if surf.sgr_mouse {
        out.extend_from_slice(format!("\x1b[<{};{};{}M", code, x + 1, y + 1).as_bytes());
    } else {
        let cx = (x + 1).min(223) as u8;
        let cy = (y + 1).min(223) as u8;
        out.extend_from_slice(&[0x1b, b'[', b'M', 32 + code, 32 + cx, 32 + cy]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vt::surface::Surface;

    fn surf() -> Surface {
        Surface::new(80, 24, [255, 255, 255], [0, 0, 0])
    }

    fn enc(surf: &Surface, sym: u32, mods: Mods) -> Vec<u8> {
        let mut out = Vec::new();
        encode_key(surf, sym, mods, &mut out);
        out
    }

    #[test]
    fn arrows_follow_cursor_key_mode() {
        let mut s = surf();
        assert_eq!(enc(&s, SYM_UP, Mods::empty()), b"\x1b[A");
        s.app_cursor_keys = true;
        assert_eq!(enc(&s, SYM_UP, Mods::empty()), b"\x1bOA");
    }

    #[test]
    fn modified_arrow_uses_csi_params() {
        let s = surf();
        assert_eq!(enc(&s, SYM_RIGHT, Mods::LCTRL), b"\x1b[1;5C");
        assert_eq!(enc(&s, SYM_LEFT, Mods::LSHIFT), b"\x1b[1;2D");
    }

    #[test]
    fn control_letters() {
        let s = surf();
        assert_eq!(enc(&s, b'c' as u32, Mods::LCTRL), [0x03]);
        assert_eq!(enc(&s, b'a' as u32, Mods::RCTRL), [0x01]);
        assert_eq!(enc(&s, b'[' as u32, Mods::LCTRL), [0x1b]);
    }

    #[test]
    fn alt_prefixes_escape() {
        let s = surf();
        assert_eq!(enc(&s, b'x' as u32, Mods::LALT), [0x1b, b'x']);
    }

    #[test]
    fn function_keys() {
        let s = surf();
        assert_eq!(enc(&s, SYM_F1, Mods::empty()), b"\x1bOP");
        assert_eq!(enc(&s, SYM_F1 + 4, Mods::empty()), b"\x1b[15~");
        assert_eq!(enc(&s, SYM_F12, Mods::empty()), b"\x1b[24~");
    }

    #[test]
    fn mouse_sgr_press_release() {
        let mut s = surf();
        s.mouse = MouseProto::Normal;
        s.sgr_mouse = true;
        let mut out = Vec::new();
        encode_mouse_button(&s, 4, 2, 1, true, Mods::empty(), &mut out);
        encode_mouse_button(&s, 4, 2, 1, false, Mods::empty(), &mut out);
        assert_eq!(out, b"\x1b[<0;5;3M\x1b[<0;5;3m");
    }

    #[test]
    fn mouse_off_reports_nothing() {
        let s = surf();
        let mut out = Vec::new();
        encode_mouse_button(&s, 0, 0, 1, true, Mods::empty(), &mut out);
        encode_mouse_motion(&s, 0, 0, false, Mods::empty(), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn motion_only_in_tracking_modes() {
        let mut s = surf();
        s.mouse = MouseProto::ButtonEvent;
        s.sgr_mouse = true;
        let mut out = Vec::new();
        encode_mouse_motion(&s, 1, 1, false, Mods::empty(), &mut out);
        assert!(out.is_empty());
        encode_mouse_motion(&s, 1, 1, true, Mods::empty(), &mut out);
        assert_eq!(out, b"\x1b[<32;2;2M");
    }
}
