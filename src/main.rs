use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use time::macros::format_description;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;

use reseed::{PackageOptions, PieceLength, Progress, package, parse_torrent};

#[derive(Parser, Debug)]
#[command(name="reseed", version, about="Create private torrents, reusing piece hashes from earlier torrents when possible")]
struct Args {
    #[arg(short, long, help="Print contents of a torrent file instead of creating one")]
    inspect: bool,

    #[arg(short, long, required_unless_present="inspect", help="Tracker announce URL")]
    tracker: Option<String>,

    #[arg(short, long, help="Prefix for the output name, written as [PREFIX].<name>.torrent")]
    prefix: Option<String>,

    #[arg(long="no-reuse-torrent", action=ArgAction::SetFalse, help="Do not look for earlier torrents next to the target")]
    reuse: bool,

    #[arg(long, help="Reuse piece hashes from this torrent file")]
    from_torrent: Option<PathBuf>,

    #[arg(long, help="Piece length in bytes (power of two); picked from the content size when omitted")]
    piece_length: Option<u64>,

    #[arg(long, help="Comment stored in the torrent")]
    comment: Option<String>,

    #[arg(long, help="Write logs to reseed.log in this directory instead of stderr")]
    log_dir: Option<PathBuf>,

    path: PathBuf,
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let timer = LocalTime::new(
        format_description!("[month]/[day]/[year] [hour repr:24]:[minute]:[second].[subsecond digits:4]"));
    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::never(dir, "reseed.log");
            let (non_blocking, guard) = non_blocking(file_appender);
            tracing_subscriber::fmt().with_writer(non_blocking).with_ansi(false).with_timer(timer).init();
            Some(guard)
        },
        None => {
            tracing_subscriber::fmt().with_writer(std::io::stderr).with_timer(timer).init();
            None
        },
    }
}

fn progress_reporter() -> impl FnMut(Progress) -> ControlFlow<()> {
    let mut bar: Option<ProgressBar> = None;
    let mut last_logged: usize = 0;
    move |progress: Progress| {
        let bar = bar.get_or_insert_with(|| {
            let style = ProgressStyle::with_template("{bar:40} {pos}/{len} pieces ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            ProgressBar::new(progress.pieces_total as u64).with_style(style)
        });
        bar.set_position(progress.pieces_done as u64);

        let percent = progress.pieces_done * 100 / progress.pieces_total.max(1);
        if percent / 10 > last_logged / 10 || progress.pieces_done == progress.pieces_total {
            info!("hashing progress: {:3} %", percent);
            last_logged = percent;
        }
        if progress.pieces_done == progress.pieces_total {
            bar.finish_and_clear();
        }
        ControlFlow::Continue(())
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = init_logging(args.log_dir.as_deref());

    if args.inspect {
        return match parse_torrent(&args.path) {
            Ok(torrent) => {
                println!("Contents of {}:\n{}", args.path.display(), torrent);
                ExitCode::SUCCESS
            },
            Err(e) => {
                eprintln!("Unable to parse file: {e}");
                ExitCode::FAILURE
            },
        };
    }

    let Some(tracker) = args.tracker.as_deref() else {
        eprintln!("a tracker URL is required");
        return ExitCode::FAILURE;
    };
    let mut options = PackageOptions::new(tracker);
    options.prefix = args.prefix;
    options.reuse = args.reuse;
    options.reuse_from = args.from_torrent;
    if let Some(n) = args.piece_length {
        options.piece_length = PieceLength::Fixed(n);
    }
    if let Some(comment) = args.comment {
        options.comment = comment;
    }

    match package(&args.path, &options, progress_reporter()) {
        Ok(packaged) => {
            match &packaged.reused_from {
                Some(source) => println!("Created {} from {}", packaged.path.display(), source.display()),
                None => println!("Created {}", packaged.path.display()),
            }
            ExitCode::SUCCESS
        },
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        },
    }
}
