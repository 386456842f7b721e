#[macro_use]
extern crate log;

use argh::FromArgs;
use env_logger::Env;
use std::io::Read;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use sailbot_sim::config::Config;
use sailbot_sim::protocol::hdlc::{FLAG, MAX_FRAME_SZ};
use sailbot_sim::protocol::HdlcCodec;
use sailbot_sim::{FleetDriver, Inbound};

#[derive(FromArgs)]
/// Simulated SailBots on a fake serial line: frames are written to stdout and read from stdin.
struct Sim {
    /// configuration file (default: one bot with default settings).
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// write one hex encoded frame per line instead of raw bytes.
    #[argh(switch)]
    hex: bool,
}

/// Escaped frame of the longest length the decoder accepts, flags included.
const MAX_RAW_FRAME_SZ: usize = 2 * MAX_FRAME_SZ + 2;

/// Splits a raw byte stream into flag delimited frames, flags included. Frames longer than
/// [`MAX_RAW_FRAME_SZ`] are dropped.
#[derive(Default)]
struct Splitter {
    buf: Vec<u8>,
}

impl Splitter {
    fn push(&mut self, b: u8) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            if b == FLAG {
                self.buf.push(b);
            }
            return None;
        }

        self.buf.push(b);

        if b != FLAG {
            if self.buf.len() >= MAX_RAW_FRAME_SZ {
                warn!("dropping unterminated frame of {} bytes", self.buf.len());
                self.buf.clear();
            }
            return None;
        }

        if self.buf.len() == 2 {
            self.buf.truncate(1);
            return None;
        }

        let frame = std::mem::replace(&mut self.buf, vec![FLAG]);
        Some(frame)
    }
}

async fn write_out(mut rx: mpsc::UnboundedReceiver<u8>, hex: bool) -> eyre::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut frames = Splitter::default();
    let mut out = Vec::new();

    while let Some(b) = rx.recv().await {
        out.push(b);
        while let Ok(b) = rx.try_recv() {
            out.push(b);
        }

        if hex {
            for b in out.drain(..) {
                if let Some(frame) = frames.push(b) {
                    let line: String = frame.iter().map(|b| format!("{:02x}", b)).collect();
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                }
            }
        } else {
            stdout.write_all(&out).await?;
            out.clear();
        }

        stdout.flush().await?;
    }

    Ok(())
}

fn read_in(inbound: Inbound) {
    let mut frames = Splitter::default();

    for b in std::io::stdin().lock().bytes() {
        match b {
            Ok(b) => {
                if let Some(frame) = frames.push(b) {
                    inbound.submit(&frame);
                }
            }
            Err(e) => {
                error!("failed to read from stdin: {:?}", e);
                return;
            }
        }
    }

    debug!("stdin closed");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(Env::default().default_filter_or("warn,sailbot_sim=debug"))
        .init();

    info!("sailbot-sim");
    let sim: Sim = argh::from_env();
    let config = match sim.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_out(rx, sim.hex));

    let driver = FleetDriver::start(config.sailbots()?, config.interval()?, HdlcCodec, tx)?;

    // Blocking reads from stdin are not cancellable, keep them off the runtime.
    let inbound = driver.inbound();
    std::thread::spawn(move || read_in(inbound));

    tokio::signal::ctrl_c().await?;

    info!("stopping: {:?}", driver.stats());
    let sink = driver.stop().await?;
    drop(sink);

    writer.await??;

    Ok(())
}
