mod access_unit;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use reorder::{Caps, Codec, Frame};
use rtsp::media::{MediaFactory, StreamConfig};
use rtsp::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rtsp-server", about = "RTSP server and H.264/H.265 reorder inspector")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve an H.264 test mount until Enter is pressed
    Serve {
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:8554")]
        bind: String,
        /// Mount path of the stream
        #[arg(long, short, default_value = "/test")]
        mount: String,
        /// Seconds to keep a connection open after its last session ends,
        /// -1 to keep it open
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        post_session_timeout: i32,
        /// Maximum number of concurrent sessions, 0 for no limit
        #[arg(long, default_value_t = 0)]
        max_sessions: usize,
    },
    /// Print the display order of an Annex-B elementary stream
    Reorder {
        file: PathBuf,
        #[arg(long, short, default_value = "h264")]
        codec: Codec,
        /// Frame rate used for the latency estimate, as N/D
        #[arg(long)]
        framerate: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Serve {
            bind,
            mount,
            post_session_timeout,
            max_sessions,
        } => serve(&bind, &mount, post_session_timeout, max_sessions),
        Command::Reorder {
            file,
            codec,
            framerate,
        } => inspect(&file, codec, framerate.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(bind: &str, mount: &str, post_session_timeout: i32, max_sessions: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        post_session_timeout,
        max_sessions,
        ..ServerConfig::default()
    };
    let mut server = Server::with_config(bind, config);
    server
        .mounts()
        .add_factory(mount, MediaFactory::new().with_stream(StreamConfig::h264(96)));
    server.start()?;

    println!("RTSP server on rtsp://{}{mount}, press Enter to stop", server.local_addr()?);
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    server.stop();
    Ok(())
}

fn inspect(file: &Path, codec: Codec, framerate: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(file)?;
    let units = access_unit::split(&data, codec)?;

    let caps = Caps {
        framerate: framerate.map(parse_framerate).transpose()?,
        ..Caps::default()
    };
    let mut engine = reorder::new(codec, true);
    engine.set_caps(&caps)?;

    println!("{} access units", units.len());
    for (n, au) in units.into_iter().enumerate() {
        if let Err(e) = engine.push(Frame::new(au)) {
            tracing::warn!(unit = n, error = %e, "dropped access unit");
        }
        print_ready(engine.as_mut());
    }
    engine.drain();
    print_ready(engine.as_mut());
    println!("latency {:?}", engine.latency());
    Ok(())
}

fn print_ready(engine: &mut dyn reorder::Reorder) {
    while let Some(frame) = engine.pop() {
        match frame.presentation_frame_number {
            Some(p) => println!("decode {:>6} -> display {p:>6}", frame.system_frame_number),
            None => println!("decode {:>6} -> display      -", frame.system_frame_number),
        }
    }
}

fn parse_framerate(s: &str) -> Result<(u32, u32), String> {
    let (n, d) = s.split_once('/').unwrap_or((s, "1"));
    match (n.trim().parse(), d.trim().parse()) {
        (Ok(n), Ok(d)) => Ok((n, d)),
        _ => Err(format!("invalid frame rate {s:?}")),
    }
}
