use log::LevelFilter;
use simplelog::{CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};
use std::path::PathBuf;
use std::process::ExitCode;

use frameterm::args::{dump_help, PackedArgs, TermArgs};
use frameterm::term;

fn setup_logging() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Info);

    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )];

    // The launcher may point us at a log directory; it is scrubbed from the
    // child environment either way
    if let Ok(dir) = std::env::var("ARCAN_FRAMESERVER_LOGDIR") {
        let path = PathBuf::from(dir).join("frameterm.log");
        match std::fs::File::create(&path) {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(err) => eprintln!("cannot open log file {}: {}", path.display(), err),
        }
    }

    let _ = CombinedLogger::init(loggers);
}

fn main() -> ExitCode {
    setup_logging();

    // Log panics before aborting
    std::panic::set_hook(Box::new(|info| {
        log::error!("PANIC: {}", info);
    }));

    let packed = PackedArgs::from_env();
    let args = TermArgs::from_packed(&packed);

    if args.help {
        dump_help();
        return ExitCode::SUCCESS;
    }

    match term::run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
