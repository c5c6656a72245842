//! Wire format for the display-server connection: newline-delimited JSON
//! frames over the Unix socket named by `ARCAN_CONNPATH`.

use serde::{Deserialize, Serialize};

use crate::vt::surface::Cell;

/// Events the host delivers to the frameserver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// Connection accepted; initial cell geometry.
    Hello { cols: u16, rows: u16 },
    /// Non-textual key press (specials, control combinations).
    Key { keysym: u32, mods: u16, subid: u16 },
    /// Translated textual input.
    Utf8 { text: String },
    Paste { text: String },
    MouseMotion { x: i32, y: i32, mods: u16, relative: bool },
    MouseButton { x: i32, y: i32, button: u8, active: bool, mods: u16 },
    Resize { cols: u16, rows: u16 },
    /// 0 = soft, 1 = hard, anything else = crash recovery.
    Reset { level: u8 },
    /// 0 = resume, 1 = suspend, 2 = terminate.
    ExecState { state: u8 },
    /// The host granted a subwindow of the given kind.
    Subwindow { id: u32, kind: SubwindowKind },
    Bye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubwindowKind {
    Debug,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSlot {
    Background,
    Foreground,
    Cursor,
    CursorAlt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCell {
    pub ch: char,
    pub fg: [u8; 3],
    pub bg: [u8; 3],
    pub attrs: u8,
}

impl From<&Cell> for WireCell {
    fn from(cell: &Cell) -> Self {
        WireCell {
            ch: cell.ch,
            fg: cell.fg,
            bg: cell.bg,
            attrs: cell.attrs.bits(),
        }
    }
}

/// Frames the frameserver sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect { title: String, tpack: bool },
    /// Bind a second connection to a previously granted subwindow.
    MapSubwindow { id: u32 },
    Line { row: u16, cells: Vec<WireCell> },
    Cursor { x: u16, y: u16, visible: bool },
    /// Marks the end of one refresh pass.
    Sync { frame: u64 },
    Ident { title: String },
    Progress { value: f32 },
    Color { slot: ColorSlot, rgb: [u8; 3], alpha: Option<u8> },
    CursorConfig { style: String, blink: u32 },
    HideCursor,
    Reset,
}
