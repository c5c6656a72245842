//! Client side of the host display connection. The protocol itself lives in
//! [`proto`]; this module owns the socket, the event pump and the refresh
//! path the render loop drives.

pub mod proto;

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::args::CursorStyle;
use crate::vt::surface::Surface;
use proto::{ClientFrame, ColorSlot, HostEvent, WireCell};

/// Outcome of one [`Screen::process`] round.
#[derive(Debug, Default)]
pub struct Processed {
    pub events: Vec<HostEvent>,
    /// Readability of the caller-supplied wake descriptors, in order.
    pub ready: Vec<bool>,
    /// The connection is gone; the render loop should exit.
    pub dead: bool,
}

pub struct Screen {
    conn: UnixStream,
    path: Option<PathBuf>,
    inbuf: Vec<u8>,
    pending: VecDeque<HostEvent>,
    cols: u16,
    rows: u16,
    last_frame: u64,
}

impl Screen {
    /// Connect to the host named by `ARCAN_CONNPATH` and wait for the
    /// geometry handshake.
    pub fn connect(title: &str, tpack: bool) -> Result<Self> {
        let path = std::env::var("ARCAN_CONNPATH")
            .context("ARCAN_CONNPATH is not set, no display to connect to")?;
        let path = PathBuf::from(path);
        let conn = UnixStream::connect(&path)
            .with_context(|| format!("connecting to display at {}", path.display()))?;
        let mut screen = Screen::from_stream(conn, 0, 0);
        screen.path = Some(path);
        screen.send(&ClientFrame::Connect { title: title.to_string(), tpack })?;
        screen.await_hello()?;
        Ok(screen)
    }

    /// Wrap an already-connected stream. Used by tests and by
    /// [`Screen::connect`].
    pub fn from_stream(conn: UnixStream, cols: u16, rows: u16) -> Self {
        let _ = conn.set_nonblocking(true);
        Screen {
            conn,
            path: None,
            inbuf: Vec::new(),
            pending: VecDeque::new(),
            cols,
            rows,
            last_frame: 0,
        }
    }

    fn await_hello(&mut self) -> Result<()> {
        // Bounded wait so a wedged server fails setup instead of hanging it
        for _ in 0..50 {
            let res = self.process(&[], 100)?;
            if res.dead {
                bail!("display closed the connection during handshake");
            }
            let mut hello = None;
            for ev in res.events {
                match ev {
                    HostEvent::Hello { cols, rows } => hello = Some((cols, rows)),
                    other => self.pending.push_back(other),
                }
            }
            if let Some((cols, rows)) = hello {
                self.cols = cols;
                self.rows = rows;
                return Ok(());
            }
        }
        bail!("display never completed the handshake");
    }

    pub fn dimensions(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn last_frame(&self) -> u64 {
        self.last_frame
    }

    /// Wait for traffic on the connection or any of `extra`, translating
    /// incoming frames into events. `timeout_ms < 0` blocks indefinitely.
    pub fn process(&mut self, extra: &[RawFd], timeout_ms: i32) -> Result<Processed> {
        let mut out = Processed {
            ready: vec![false; extra.len()],
            ..Processed::default()
        };
        while let Some(ev) = self.pending.pop_front() {
            out.events.push(ev);
        }

        let mut fds = Vec::with_capacity(1 + extra.len());
        fds.push(libc::pollfd {
            fd: self.conn.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for fd in extra {
            fds.push(libc::pollfd { fd: *fd, events: libc::POLLIN, revents: 0 });
        }

        // Already-queued events only need a poll glance, not a block
        let timeout = if out.events.is_empty() { timeout_ms } else { 0 };
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(out);
            }
            return Err(err.into());
        }

        for (i, fd) in fds[1..].iter().enumerate() {
            out.ready[i] = fd.revents != 0;
        }

        if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            out.dead = true;
        }
        if fds[0].revents & libc::POLLIN != 0 {
            match self.fill_inbuf() {
                Ok(open) => {
                    if !open {
                        out.dead = true;
                    }
                }
                Err(err) => {
                    log::warn!("display read error: {}", err);
                    out.dead = true;
                }
            }
            self.parse_events(&mut out.events);
            if out.events.iter().any(|ev| matches!(ev, HostEvent::Bye)) {
                out.dead = true;
            }
        }

        Ok(out)
    }

    /// Drain the socket into the line buffer. Returns false on EOF.
    fn fill_inbuf(&mut self) -> std::io::Result<bool> {
        let mut buf = [0u8; 4096];
        loop {
            match self.conn.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => self.inbuf.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn parse_events(&mut self, events: &mut Vec<HostEvent>) {
        while let Some(pos) = self.inbuf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.inbuf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<HostEvent>(line) {
                Ok(ev) => events.push(ev),
                Err(err) => {
                    log::warn!("malformed display event, skipped: {}", err);
                }
            }
        }
    }

    pub fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        let mut bytes = serde_json::to_vec(frame)?;
        bytes.push(b'\n');
        let mut rest = &bytes[..];
        while !rest.is_empty() {
            match self.conn.write(rest) {
                Ok(0) => bail!("display connection closed mid-write"),
                Ok(n) => rest = &rest[n..],
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    let mut pfd = [libc::pollfd {
                        fd: self.conn.as_raw_fd(),
                        events: libc::POLLOUT,
                        revents: 0,
                    }];
                    unsafe { libc::poll(pfd.as_mut_ptr(), 1, 100) };
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Push dirty rows and cursor state to the host. A zeroed frame counter
    /// (fresh connection or resize) forces a full repaint.
    pub fn refresh(&mut self, surf: &mut Surface) -> Result<()> {
        if self.last_frame == 0 {
            surf.mark_all_dirty();
        }
        let rows: Vec<u16> = surf.dirty_rows().collect();
        for row in rows {
            let cells: Vec<WireCell> = match surf.row(row) {
                Some(cells) => cells.iter().map(WireCell::from).collect(),
                None => continue,
            };
            self.send(&ClientFrame::Line { row, cells })?;
        }
        surf.clear_dirty();
        self.send(&ClientFrame::Cursor {
            x: surf.cursor_x,
            y: surf.cursor_y,
            visible: surf.cursor_visible,
        })?;
        self.last_frame += 1;
        self.send(&ClientFrame::Sync { frame: self.last_frame })?;
        Ok(())
    }

    pub fn on_resized(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        self.last_frame = 0;
    }

    pub fn ident(&mut self, title: &str) -> Result<()> {
        self.send(&ClientFrame::Ident { title: title.to_string() })
    }

    pub fn progress(&mut self, value: f32) -> Result<()> {
        self.send(&ClientFrame::Progress { value })
    }

    pub fn set_color(&mut self, slot: ColorSlot, rgb: [u8; 3], alpha: Option<u8>) -> Result<()> {
        self.send(&ClientFrame::Color { slot, rgb, alpha })
    }

    pub fn cursor_config(&mut self, style: CursorStyle, blink: u32) -> Result<()> {
        self.send(&ClientFrame::CursorConfig { style: style.to_string(), blink })
    }

    pub fn hide_cursor(&mut self) -> Result<()> {
        self.send(&ClientFrame::HideCursor)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.last_frame = 0;
        self.send(&ClientFrame::Reset)
    }

    /// Open a second connection bound to a granted subwindow.
    pub fn map_subwindow(&self, id: u32) -> Result<UnixStream> {
        let path = self
            .path
            .as_ref()
            .context("no display path, cannot map subwindow")?;
        let mut conn = UnixStream::connect(path)
            .with_context(|| format!("subwindow connect to {}", path.display()))?;
        let mut bytes = serde_json::to_vec(&ClientFrame::MapSubwindow { id })?;
        bytes.push(b'\n');
        conn.write_all(&bytes)?;
        conn.set_nonblocking(true)?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::io::BufReader;

    fn pair() -> (Screen, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        (Screen::from_stream(client, 10, 4), server)
    }

    fn read_frames(server: &mut UnixStream, expect: usize) -> Vec<ClientFrame> {
        let mut reader = BufReader::new(server.try_clone().unwrap());
        let mut out = Vec::new();
        for _ in 0..expect {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[test]
    fn events_round_through_process() {
        let (mut screen, mut server) = pair();
        server
            .write_all(b"{\"type\":\"resize\",\"cols\":100,\"rows\":30}\n")
            .unwrap();
        let res = screen.process(&[], 1000).unwrap();
        assert_eq!(res.events, vec![HostEvent::Resize { cols: 100, rows: 30 }]);
        assert!(!res.dead);
    }

    #[test]
    fn partial_lines_wait_for_completion() {
        let (mut screen, mut server) = pair();
        server.write_all(b"{\"type\":\"bye\"").unwrap();
        let res = screen.process(&[], 100).unwrap();
        assert!(res.events.is_empty());
        server.write_all(b"}\n").unwrap();
        let res = screen.process(&[], 100).unwrap();
        assert_eq!(res.events, vec![HostEvent::Bye]);
        assert!(res.dead);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (mut screen, mut server) = pair();
        server
            .write_all(b"not json\n{\"type\":\"reset\",\"level\":0}\n")
            .unwrap();
        let res = screen.process(&[], 1000).unwrap();
        assert_eq!(res.events, vec![HostEvent::Reset { level: 0 }]);
    }

    #[test]
    fn refresh_sends_dirty_rows_then_sync() {
        let (mut screen, mut server) = pair();
        let mut surf = Surface::new(4, 2, [255, 255, 255], [0, 0, 0]);
        screen.last_frame = 1; // pretend a frame already went out
        surf.clear_dirty();
        surf.put_char('x');
        screen.refresh(&mut surf).unwrap();
        let frames = read_frames(&mut server, 3);
        match &frames[0] {
            ClientFrame::Line { row, cells } => {
                assert_eq!(*row, 0);
                assert_eq!(cells[0].ch, 'x');
            }
            other => panic!("expected line frame, got {:?}", other),
        }
        assert!(matches!(frames[1], ClientFrame::Cursor { .. }));
        assert!(matches!(frames[2], ClientFrame::Sync { frame: 2 }));
    }

    #[test]
    fn resize_forces_full_repaint() {
        let (mut screen, mut server) = pair();
        let mut surf = Surface::new(4, 2, [255, 255, 255], [0, 0, 0]);
        screen.last_frame = 5;
        screen.on_resized(4, 2);
        assert_eq!(screen.last_frame(), 0);
        surf.clear_dirty();
        screen.refresh(&mut surf).unwrap();
        // All rows went out even though none were dirty
        let frames = read_frames(&mut server, 4);
        let lines = frames
            .iter()
            .filter(|f| matches!(f, ClientFrame::Line { .. }))
            .count();
        assert_eq!(lines, 2);
    }

    #[test]
    fn wake_fd_readiness_is_reported() {
        let (mut screen, _server) = pair();
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"1").unwrap();
        let res = screen.process(&[b.as_raw_fd()], 100).unwrap();
        assert_eq!(res.ready, vec![true]);
    }

    #[test]
    fn peer_close_marks_dead() {
        let (mut screen, server) = pair();
        drop(server);
        let res = screen.process(&[], 100).unwrap();
        assert!(res.dead);
    }
}
