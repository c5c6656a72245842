//! Packed-argument parsing. The launcher hands us a single string via
//! `ARCAN_ARG` in the form `key1=value:key2:key3=value`; keys may repeat.

use std::fmt;

/// Raw packed argument bag with indexed lookup for repeatable keys.
pub struct PackedArgs {
    entries: Vec<(String, Option<String>)>,
}

impl PackedArgs {
    pub fn parse(packed: &str) -> Self {
        let mut entries = Vec::new();
        for chunk in packed.split(':') {
            if chunk.is_empty() {
                continue;
            }
            match chunk.split_once('=') {
                Some((k, v)) => entries.push((k.to_string(), Some(v.to_string()))),
                None => entries.push((chunk.to_string(), None)),
            }
        }
        PackedArgs { entries }
    }

    pub fn from_env() -> Self {
        let packed = std::env::var("ARCAN_ARG").unwrap_or_default();
        Self::parse(&packed)
    }

    /// Nth value for `key` (keys may repeat). A present key without a value
    /// yields `Some(None)`.
    pub fn lookup(&self, key: &str, index: usize) -> Option<Option<&str>> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .nth(index)
            .map(|(_, v)| v.as_deref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.lookup(key, 0).is_some()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.lookup(key, 0).flatten()
    }

    /// All values for a repeatable key, skipping value-less occurrences.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, v)| k == key && v.is_some())
            .filter_map(|(_, v)| v.as_deref())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorStyle {
    Block,
    Frame,
    HalfBlock,
    VLine,
    ULine,
}

impl CursorStyle {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "block" => Some(CursorStyle::Block),
            "frame" => Some(CursorStyle::Frame),
            "halfblock" => Some(CursorStyle::HalfBlock),
            "vline" => Some(CursorStyle::VLine),
            "uline" => Some(CursorStyle::ULine),
            _ => None,
        }
    }
}

impl fmt::Display for CursorStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CursorStyle::Block => "block",
            CursorStyle::Frame => "frame",
            CursorStyle::HalfBlock => "halfblock",
            CursorStyle::VLine => "vline",
            CursorStyle::ULine => "uline",
        };
        f.write_str(name)
    }
}

/// Parse `r,g,b` or `r,g,b,a`. Returns the components and how many were set.
pub fn parse_color(input: &str) -> Option<([u8; 4], usize)> {
    let mut out = [0u8, 0, 0, 255];
    let mut n = 0;
    for part in input.split(',') {
        if n >= 4 {
            return None;
        }
        out[n] = part.trim().parse().ok()?;
        n += 1;
    }
    if n < 3 {
        return None;
    }
    Some((out, n))
}

/// Parse `index,r,g,b[,a]` as used by the `ci` argument.
pub fn parse_indexed_color(input: &str) -> Option<(u8, [u8; 4])> {
    let (idx, rest) = input.split_once(',')?;
    let idx = idx.trim().parse().ok()?;
    let (col, _) = parse_color(rest)?;
    Some((idx, col))
}

/// Everything the frameserver derives from `ARCAN_ARG` before startup.
/// Read-only once built.
pub struct TermArgs {
    pub env_overrides: Vec<(String, String)>,
    pub chdir: Option<String>,
    pub bg_color: Option<[u8; 4]>,
    pub fg_color: Option<[u8; 4]>,
    pub cursor_color: Option<[u8; 4]>,
    pub cursor_alt_color: Option<[u8; 4]>,
    pub bg_alpha: Option<u8>,
    pub palette_overrides: Vec<(u8, [u8; 4])>,
    pub cursor: Option<CursorStyle>,
    pub blink_ticks: u32,
    pub login: Option<Option<String>>,
    pub exec: Option<String>,
    pub cmd: Option<String>,
    pub keep_alive: bool,
    pub pipe: bool,
    pub palette: Option<String>,
    pub tpack: bool,
    pub cli: bool,
    pub help: bool,
}

impl TermArgs {
    pub fn from_packed(args: &PackedArgs) -> Self {
        let mut env_overrides = Vec::new();
        for val in args.values("env") {
            if let Some((k, v)) = val.split_once('=') {
                env_overrides.push((k.to_string(), v.to_string()));
            } else {
                log::warn!("env argument without '=', ignored: {}", val);
            }
        }

        let mut palette_overrides = Vec::new();
        let mut ind = 0;
        while let Some(val) = args.lookup("ci", ind) {
            ind += 1;
            match val.and_then(parse_indexed_color) {
                Some((idx, col)) => palette_overrides.push((idx, col)),
                None => log::warn!("malformed ci argument, ignored"),
            }
        }

        let color = |key: &str| args.value(key).and_then(parse_color).map(|(c, _)| c);

        let cursor = args.value("cursor").and_then(|name| {
            let style = CursorStyle::from_name(name);
            if style.is_none() {
                log::warn!("unknown cursor style: {}", name);
            }
            style
        });

        #[cfg(feature = "noexec")]
        let exec = {
            if args.has("exec") {
                log::warn!("permission denied, noexec compiled in");
            }
            None
        };
        #[cfg(not(feature = "noexec"))]
        let exec = args.value("exec").map(str::to_string);

        TermArgs {
            env_overrides,
            chdir: args.value("chdir").map(str::to_string),
            bg_color: color("bgc"),
            fg_color: color("fgc"),
            cursor_color: color("cc"),
            cursor_alt_color: color("cl"),
            bg_alpha: args.value("bgalpha").and_then(|v| v.trim().parse().ok()),
            palette_overrides,
            cursor,
            blink_ticks: args
                .value("blink")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(12),
            login: args
                .lookup("login", 0)
                .map(|user| user.map(str::to_string)),
            exec,
            cmd: args.value("cmd").map(str::to_string),
            keep_alive: args.has("keep_alive"),
            pipe: args.has("pipe"),
            palette: args.value("palette").map(str::to_string),
            tpack: args.has("tpack"),
            cli: args.has("cli"),
            help: args.has("help"),
        }
    }
}

pub fn dump_help() {
    println!(
        "Environment variables:\n\
         ARCAN_CONNPATH=path_to_server\n\
         ARCAN_TERMINAL_EXEC=value : run value through /bin/sh -c instead of shell\n\
         ARCAN_TERMINAL_ARGV : exec will route through execvp instead of execv\n\
         ARCAN_TERMINAL_PIDFD_OUT : writes exec pid into pidfd\n\
         ARCAN_TERMINAL_PIDFD_IN  : exec continues on incoming data\n\n\
         ARCAN_ARG=packed_args (key1=value:key2:key3=value)\n\n\
         Accepted packed_args:\n\
         \x20env        key=val    override default environment (repeatable)\n\
         \x20chdir      dir        change working dir before spawning shell\n\
         \x20bgalpha    0..255     background opacity (default: 255, opaque)\n\
         \x20bgc        r,g,b      background color\n\
         \x20fgc        r,g,b      foreground color\n\
         \x20ci         ind,r,g,b  override palette at index (repeatable)\n\
         \x20cc         r,g,b      cursor color\n\
         \x20cl         r,g,b      cursor alternate (locked) state color\n\
         \x20cursor     name       block, frame, halfblock, vline, uline\n\
         \x20blink      ticks      blink period, 0 to disable (default: 12)\n\
         \x20login      [user]     login (optional: user, only works for root)\n\
         \x20exec       cmd        run a shell command instead of the shell\n\
         \x20cmd        arg        extra argument to the interactive shell\n\
         \x20keep_alive            don't exit if the terminal or shell terminates\n\
         \x20pipe                  map stdin-stdout\n\
         \x20palette    name       use built-in palette (below)\n\
         \x20tpack                 use text-pack (server-side rendering) mode\n\
         \x20cli                   non-vt cli mode (separate frameserver)\n\
         Built-in palettes:\n\
         default, solarized, solarized-black, solarized-white, srcery"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_split_and_lookup() {
        let args = PackedArgs::parse("env=A=1:keep_alive:env=B=2:blink=0");
        assert_eq!(args.lookup("env", 0), Some(Some("A=1")));
        assert_eq!(args.lookup("env", 1), Some(Some("B=2")));
        assert_eq!(args.lookup("env", 2), None);
        assert_eq!(args.lookup("keep_alive", 0), Some(None));
        assert!(args.has("blink"));
        assert!(!args.has("pipe"));
    }

    #[test]
    fn color_parsing() {
        assert_eq!(parse_color("0,0,0"), Some(([0, 0, 0, 255], 3)));
        assert_eq!(parse_color("10, 20, 30, 40"), Some(([10, 20, 30, 40], 4)));
        assert_eq!(parse_color("1,2"), None);
        assert_eq!(parse_color("1,2,3,4,5"), None);
        assert_eq!(parse_color("256,0,0"), None);
        assert_eq!(parse_indexed_color("3,255,128,0"), Some((3, [255, 128, 0, 255])));
    }

    #[test]
    fn term_args_scenario() {
        let packed = PackedArgs::parse("palette=solarized:bgc=0,0,0");
        let args = TermArgs::from_packed(&packed);
        assert_eq!(args.palette.as_deref(), Some("solarized"));
        assert_eq!(args.bg_color, Some([0, 0, 0, 255]));
        assert!(!args.keep_alive);
        assert_eq!(args.blink_ticks, 12);
    }

    #[test]
    fn term_args_flags_and_env() {
        let packed =
            PackedArgs::parse("keep_alive:pipe:env=FOO=bar:env=BAZ=qux:cursor=uline:blink=4");
        let args = TermArgs::from_packed(&packed);
        assert!(args.keep_alive);
        assert!(args.pipe);
        assert_eq!(args.cursor, Some(CursorStyle::ULine));
        assert_eq!(args.blink_ticks, 4);
        assert_eq!(
            args.env_overrides,
            vec![("FOO".into(), "bar".into()), ("BAZ".into(), "qux".into())]
        );
    }

    #[test]
    fn login_with_and_without_user() {
        let bare = TermArgs::from_packed(&PackedArgs::parse("login"));
        assert_eq!(bare.login, Some(None));
        let user = TermArgs::from_packed(&PackedArgs::parse("login=guest"));
        assert_eq!(user.login, Some(Some("guest".to_string())));
        let none = TermArgs::from_packed(&PackedArgs::parse("pipe"));
        assert_eq!(none.login, None);
    }

    #[cfg(not(feature = "noexec"))]
    #[test]
    fn exec_argument() {
        let args = TermArgs::from_packed(&PackedArgs::parse("exec=/bin/echo hi"));
        assert_eq!(args.exec.as_deref(), Some("/bin/echo hi"));
    }
}
