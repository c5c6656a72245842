//! The cell grid the state machine renders into. One instance per terminal,
//! guarded by the fabric lock; the render loop reads it during refresh.

use bitflags::bitflags;
use unicode_width::UnicodeWidthChar;

use super::palette::Rgb;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CellAttrs: u8 {
        const BOLD = 1 << 0;
        const UNDERLINE = 1 << 1;
        const ITALIC = 1 << 2;
        const INVERSE = 1 << 3;
        /// Right half of a double-width glyph.
        const WIDE_SPACER = 1 << 4;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg: Rgb,
    pub bg: Rgb,
    pub attrs: CellAttrs,
}

/// Mouse reporting state selected through DEC private modes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MouseProto {
    #[default]
    Off,
    /// 9: press only
    X10,
    /// 1000: press + release
    Normal,
    /// 1002: press + release + drag motion
    ButtonEvent,
    /// 1003: all motion
    AnyEvent,
}

pub struct Surface {
    pub cols: u16,
    pub rows: u16,
    grid: Vec<Vec<Cell>>,
    pub cursor_x: u16,
    pub cursor_y: u16,
    saved_cursor: Option<(u16, u16)>,
    scroll_top: u16,
    scroll_bottom: u16,
    pub origin_mode: bool,
    pub cursor_visible: bool,
    pub auto_wrap: bool,
    pub insert_mode: bool,
    pub bracketed_paste: bool,
    pub app_cursor_keys: bool,
    pub mouse: MouseProto,
    pub sgr_mouse: bool,
    // Pen state applied to newly written cells
    pub pen_fg: Rgb,
    pub pen_bg: Rgb,
    pub pen_attrs: CellAttrs,
    pub default_fg: Rgb,
    pub default_bg: Rgb,
    blank: Cell,
    // Alternate screen buffer
    alt_grid: Option<Vec<Vec<Cell>>>,
    alt_cursor: Option<(u16, u16)>,
    pub in_alt_screen: bool,
    dirty_rows: Vec<bool>,
}

impl Surface {
    pub fn new(cols: u16, rows: u16, fg: Rgb, bg: Rgb) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        let blank = Cell { ch: ' ', fg, bg, attrs: CellAttrs::empty() };
        Surface {
            cols,
            rows,
            grid: vec![vec![blank.clone(); cols as usize]; rows as usize],
            cursor_x: 0,
            cursor_y: 0,
            saved_cursor: None,
            scroll_top: 0,
            scroll_bottom: rows - 1,
            origin_mode: false,
            cursor_visible: true,
            auto_wrap: true,
            insert_mode: false,
            bracketed_paste: false,
            app_cursor_keys: false,
            mouse: MouseProto::Off,
            sgr_mouse: false,
            pen_fg: fg,
            pen_bg: bg,
            pen_attrs: CellAttrs::empty(),
            default_fg: fg,
            default_bg: bg,
            blank,
            alt_grid: None,
            alt_cursor: None,
            in_alt_screen: false,
            dirty_rows: vec![true; rows as usize],
        }
    }

    pub fn row(&self, y: u16) -> Option<&[Cell]> {
        self.grid.get(y as usize).map(|r| r.as_slice())
    }

    /// Text content of a row with trailing blanks stripped.
    pub fn row_text(&self, y: u16) -> String {
        let mut out: String = self
            .row(y)
            .map(|cells| {
                cells
                    .iter()
                    .filter(|c| !c.attrs.contains(CellAttrs::WIDE_SPACER))
                    .map(|c| c.ch)
                    .collect()
            })
            .unwrap_or_default();
        while out.ends_with(' ') {
            out.pop();
        }
        out
    }

    fn mark_dirty(&mut self, row: usize) {
        if let Some(flag) = self.dirty_rows.get_mut(row) {
            *flag = true;
        }
    }

    pub fn mark_all_dirty(&mut self) {
        for flag in &mut self.dirty_rows {
            *flag = true;
        }
    }

    pub fn dirty_rows(&self) -> impl Iterator<Item = u16> + '_ {
        self.dirty_rows
            .iter()
            .enumerate()
            .filter(|(_, d)| **d)
            .map(|(i, _)| i as u16)
    }

    pub fn clear_dirty(&mut self) {
        for flag in &mut self.dirty_rows {
            *flag = false;
        }
    }

    fn pen_cell(&self, ch: char) -> Cell {
        Cell { ch, fg: self.pen_fg, bg: self.pen_bg, attrs: self.pen_attrs }
    }

    pub fn put_char(&mut self, ch: char) {
        let width = ch.width().unwrap_or(1) as u16;
        if width == 0 {
            // Combining mark: attach to the previous cell
            let (x, y) = (self.cursor_x, self.cursor_y);
            if x > 0 {
                if let Some(cell) =
                    self.grid.get_mut(y as usize).and_then(|r| r.get_mut(x as usize - 1))
                {
                    let mut s = cell.ch.to_string();
                    s.push(ch);
                    // Keep the base glyph; the combined form is the host's problem
                    cell.ch = s.chars().next().unwrap_or(cell.ch);
                }
            }
            return;
        }

        if self.cursor_x + width > self.cols {
            if self.auto_wrap {
                self.cursor_x = 0;
                self.advance_line();
            } else {
                self.cursor_x = self.cols - width.min(self.cols);
            }
        }

        let row = self.cursor_y as usize;
        let col = self.cursor_x as usize;
        if self.insert_mode {
            if let Some(line) = self.grid.get_mut(row) {
                for _ in 0..width {
                    if col < line.len() {
                        line.insert(col, self.blank.clone());
                        line.pop();
                    }
                }
            }
        }
        let cell = self.pen_cell(ch);
        let mut spacer = self.pen_cell(' ');
        spacer.attrs |= CellAttrs::WIDE_SPACER;
        if let Some(line) = self.grid.get_mut(row) {
            if col < line.len() {
                line[col] = cell;
            }
            if width == 2 && col + 1 < line.len() {
                line[col + 1] = spacer;
            }
        }
        self.mark_dirty(row);
        self.cursor_x = (self.cursor_x + width).min(self.cols);
    }

    pub fn newline(&mut self) {
        self.advance_line();
    }

    pub fn carriage_return(&mut self) {
        self.cursor_x = 0;
    }

    pub fn backspace(&mut self) {
        self.cursor_x = self.cursor_x.saturating_sub(1);
    }

    pub fn tab(&mut self) {
        let next = ((self.cursor_x / 8) + 1) * 8;
        self.cursor_x = next.min(self.cols - 1);
    }

    fn advance_line(&mut self) {
        if self.cursor_y == self.scroll_bottom {
            self.scroll_up(1);
        } else if self.cursor_y < self.rows - 1 {
            self.cursor_y += 1;
        }
    }

    pub fn scroll_up(&mut self, n: u16) {
        let top = self.scroll_top as usize;
        let bottom = self.scroll_bottom as usize;
        for _ in 0..n {
            if top < self.grid.len() {
                self.grid.remove(top);
            }
            let insert_pos = bottom.min(self.grid.len());
            self.grid.insert(insert_pos, vec![self.blank.clone(); self.cols as usize]);
        }
        self.grid
            .resize(self.rows as usize, vec![self.blank.clone(); self.cols as usize]);
        for r in top..=bottom.min(self.rows as usize - 1) {
            self.mark_dirty(r);
        }
    }

    pub fn scroll_down(&mut self, n: u16) {
        let top = self.scroll_top as usize;
        let bottom = self.scroll_bottom as usize;
        for _ in 0..n {
            if bottom < self.grid.len() {
                self.grid.remove(bottom);
            }
            self.grid.insert(top, vec![self.blank.clone(); self.cols as usize]);
        }
        self.grid
            .resize(self.rows as usize, vec![self.blank.clone(); self.cols as usize]);
        for r in top..=bottom.min(self.rows as usize - 1) {
            self.mark_dirty(r);
        }
    }

    pub fn erase_in_display(&mut self, mode: u16) {
        let row = self.cursor_y as usize;
        let col = self.cursor_x as usize;
        match mode {
            0 => {
                self.erase_span(row, col, self.cols as usize);
                for r in (row + 1)..self.grid.len() {
                    self.erase_span(r, 0, self.cols as usize);
                }
            }
            1 => {
                for r in 0..row {
                    self.erase_span(r, 0, self.cols as usize);
                }
                self.erase_span(row, 0, col + 1);
            }
            2 | 3 => {
                for r in 0..self.grid.len() {
                    self.erase_span(r, 0, self.cols as usize);
                }
            }
            _ => {}
        }
    }

    pub fn erase_in_line(&mut self, mode: u16) {
        let row = self.cursor_y as usize;
        let col = self.cursor_x as usize;
        match mode {
            0 => self.erase_span(row, col, self.cols as usize),
            1 => self.erase_span(row, 0, col + 1),
            2 => self.erase_span(row, 0, self.cols as usize),
            _ => {}
        }
    }

    fn erase_span(&mut self, row: usize, from: usize, to: usize) {
        // Erased cells take the pen background, not the default
        let blank = Cell {
            ch: ' ',
            fg: self.pen_fg,
            bg: self.pen_bg,
            attrs: CellAttrs::empty(),
        };
        if let Some(line) = self.grid.get_mut(row) {
            for c in from..to.min(line.len()) {
                line[c] = blank.clone();
            }
        }
        self.mark_dirty(row);
    }

    pub fn cursor_up(&mut self, n: u16) {
        self.cursor_y = self.cursor_y.saturating_sub(n);
    }

    pub fn cursor_down(&mut self, n: u16) {
        self.cursor_y = (self.cursor_y + n).min(self.rows - 1);
    }

    pub fn cursor_forward(&mut self, n: u16) {
        self.cursor_x = (self.cursor_x + n).min(self.cols - 1);
    }

    pub fn cursor_backward(&mut self, n: u16) {
        self.cursor_x = self.cursor_x.saturating_sub(n);
    }

    pub fn set_cursor_pos(&mut self, row: u16, col: u16) {
        let row = if self.origin_mode { row + self.scroll_top } else { row };
        self.cursor_y = row.min(self.rows - 1);
        self.cursor_x = col.min(self.cols - 1);
    }

    pub fn save_cursor(&mut self) {
        self.saved_cursor = Some((self.cursor_x, self.cursor_y));
    }

    pub fn restore_cursor(&mut self) {
        if let Some((x, y)) = self.saved_cursor {
            self.cursor_x = x.min(self.cols - 1);
            self.cursor_y = y.min(self.rows - 1);
        }
    }

    pub fn insert_lines(&mut self, n: u16) {
        let row = self.cursor_y as usize;
        let bottom = self.scroll_bottom as usize;
        if row > bottom {
            return;
        }
        for _ in 0..n {
            if bottom < self.grid.len() {
                self.grid.remove(bottom);
            }
            self.grid.insert(row, vec![self.blank.clone(); self.cols as usize]);
        }
        self.grid
            .resize(self.rows as usize, vec![self.blank.clone(); self.cols as usize]);
        for r in row..=bottom {
            self.mark_dirty(r);
        }
    }

    pub fn delete_lines(&mut self, n: u16) {
        let row = self.cursor_y as usize;
        let bottom = self.scroll_bottom as usize;
        if row > bottom {
            return;
        }
        for _ in 0..n {
            if row < self.grid.len() {
                self.grid.remove(row);
            }
            let insert_pos = bottom.min(self.grid.len());
            self.grid.insert(insert_pos, vec![self.blank.clone(); self.cols as usize]);
        }
        self.grid
            .resize(self.rows as usize, vec![self.blank.clone(); self.cols as usize]);
        for r in row..=bottom {
            self.mark_dirty(r);
        }
    }

    pub fn delete_chars(&mut self, n: u16) {
        let row = self.cursor_y as usize;
        let col = self.cursor_x as usize;
        if let Some(line) = self.grid.get_mut(row) {
            for _ in 0..n {
                if col < line.len() {
                    line.remove(col);
                    line.push(self.blank.clone());
                }
            }
        }
        self.mark_dirty(row);
    }

    pub fn insert_chars(&mut self, n: u16) {
        let row = self.cursor_y as usize;
        let col = self.cursor_x as usize;
        if let Some(line) = self.grid.get_mut(row) {
            for _ in 0..n {
                if col < line.len() {
                    line.insert(col, self.blank.clone());
                    line.pop();
                }
            }
        }
        self.mark_dirty(row);
    }

    pub fn erase_chars(&mut self, n: u16) {
        let row = self.cursor_y as usize;
        let col = self.cursor_x as usize;
        self.erase_span(row, col, col + n as usize);
    }

    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        if top >= bottom {
            return;
        }
        self.scroll_top = top.min(self.rows - 1);
        self.scroll_bottom = bottom.min(self.rows - 1);
        self.cursor_x = 0;
        self.cursor_y = if self.origin_mode { self.scroll_top } else { 0 };
    }

    pub fn reverse_index(&mut self) {
        if self.cursor_y == self.scroll_top {
            self.scroll_down(1);
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
        }
    }

    pub fn enter_alt_screen(&mut self) {
        if self.in_alt_screen {
            return;
        }
        self.in_alt_screen = true;
        self.alt_cursor = Some((self.cursor_x, self.cursor_y));
        let saved = std::mem::replace(
            &mut self.grid,
            vec![vec![self.blank.clone(); self.cols as usize]; self.rows as usize],
        );
        self.alt_grid = Some(saved);
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.mark_all_dirty();
    }

    pub fn leave_alt_screen(&mut self) {
        if !self.in_alt_screen {
            return;
        }
        self.in_alt_screen = false;
        if let Some(grid) = self.alt_grid.take() {
            self.grid = grid;
            self.grid
                .resize(self.rows as usize, vec![self.blank.clone(); self.cols as usize]);
            for line in &mut self.grid {
                line.resize(self.cols as usize, self.blank.clone());
            }
        }
        if let Some((x, y)) = self.alt_cursor.take() {
            self.cursor_x = x.min(self.cols - 1);
            self.cursor_y = y.min(self.rows - 1);
        }
        self.mark_all_dirty();
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        if cols == self.cols && rows == self.rows {
            return;
        }
        self.cols = cols;
        self.rows = rows;
        for line in &mut self.grid {
            line.resize(cols as usize, self.blank.clone());
        }
        self.grid
            .resize(rows as usize, vec![self.blank.clone(); cols as usize]);
        if let Some(alt) = &mut self.alt_grid {
            for line in alt.iter_mut() {
                line.resize(cols as usize, self.blank.clone());
            }
            alt.resize(rows as usize, vec![self.blank.clone(); cols as usize]);
        }
        self.cursor_x = self.cursor_x.min(cols - 1);
        self.cursor_y = self.cursor_y.min(rows - 1);
        self.scroll_top = 0;
        self.scroll_bottom = rows - 1;
        self.dirty_rows = vec![true; rows as usize];
    }

    /// Full reset back to the power-on state, keeping dimensions and the
    /// configured default colors.
    pub fn hard_reset(&mut self) {
        *self = Surface::new(self.cols, self.rows, self.default_fg, self.default_bg);
    }

    pub fn set_defaults(&mut self, fg: Rgb, bg: Rgb) {
        self.default_fg = fg;
        self.default_bg = bg;
        self.pen_fg = fg;
        self.pen_bg = bg;
        self.blank = Cell { ch: ' ', fg, bg, attrs: CellAttrs::empty() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surf() -> Surface {
        Surface::new(10, 4, [255, 255, 255], [0, 0, 0])
    }

    fn feed_str(s: &mut Surface, text: &str) {
        for ch in text.chars() {
            s.put_char(ch);
        }
    }

    #[test]
    fn put_and_read_back() {
        let mut s = surf();
        feed_str(&mut s, "hello");
        assert_eq!(s.row_text(0), "hello");
        assert_eq!(s.cursor_x, 5);
    }

    #[test]
    fn wrap_and_scroll() {
        let mut s = surf();
        feed_str(&mut s, "0123456789ab");
        assert_eq!(s.row_text(0), "0123456789");
        assert_eq!(s.row_text(1), "ab");
        for _ in 0..3 {
            s.carriage_return();
            s.newline();
        }
        // First row scrolled out
        assert_eq!(s.row_text(0), "ab");
    }

    #[test]
    fn wide_glyph_takes_two_cells() {
        let mut s = surf();
        s.put_char('画');
        assert_eq!(s.cursor_x, 2);
        let row = s.row(0).unwrap();
        assert_eq!(row[0].ch, '画');
        assert!(row[1].attrs.contains(CellAttrs::WIDE_SPACER));
    }

    #[test]
    fn erase_line_modes() {
        let mut s = surf();
        feed_str(&mut s, "abcdefghij");
        s.cursor_x = 4;
        s.erase_in_line(0);
        assert_eq!(s.row_text(0), "abcd");
        s.cursor_x = 2;
        s.erase_in_line(1);
        assert_eq!(s.row_text(0), "   d");
    }

    #[test]
    fn scroll_region_constrained() {
        let mut s = surf();
        for (i, line) in ["aa", "bb", "cc", "dd"].iter().enumerate() {
            s.set_cursor_pos(i as u16, 0);
            feed_str(&mut s, line);
        }
        s.set_scroll_region(1, 2);
        s.set_cursor_pos(2, 0);
        s.newline();
        assert_eq!(s.row_text(0), "aa");
        assert_eq!(s.row_text(1), "cc");
        assert_eq!(s.row_text(2), "");
        assert_eq!(s.row_text(3), "dd");
    }

    #[test]
    fn alt_screen_round_trip() {
        let mut s = surf();
        feed_str(&mut s, "main");
        s.enter_alt_screen();
        assert_eq!(s.row_text(0), "");
        feed_str(&mut s, "alt");
        s.leave_alt_screen();
        assert_eq!(s.row_text(0), "main");
        assert_eq!(s.cursor_x, 4);
    }

    #[test]
    fn resize_clamps_cursor_and_region() {
        let mut s = surf();
        s.set_cursor_pos(3, 9);
        s.resize(5, 2);
        assert!(s.cursor_x < 5 && s.cursor_y < 2);
        s.newline();
        s.newline();
        // Region reset to full screen, no panic on scroll
    }

    #[test]
    fn dirty_tracking() {
        let mut s = surf();
        s.clear_dirty();
        assert_eq!(s.dirty_rows().count(), 0);
        s.put_char('x');
        assert_eq!(s.dirty_rows().collect::<Vec<_>>(), vec![0]);
        s.clear_dirty();
        s.set_cursor_pos(2, 0);
        s.put_char('y');
        assert_eq!(s.dirty_rows().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn origin_mode_offsets_cursor() {
        let mut s = surf();
        s.origin_mode = true;
        s.set_scroll_region(1, 3);
        s.set_cursor_pos(0, 0);
        assert_eq!(s.cursor_y, 1);
    }
}
