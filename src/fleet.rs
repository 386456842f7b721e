//! Drives a fleet of simulated bots on a fixed tick and bridges them to a byte-wise serial link.
//!
//! Every tick each bot advances its model and its telemetry frame is written to the [`ByteSink`]
//! one byte at a time. Inbound frames are decoded once and offered to every bot, each bot
//! filtering on the destination address.
//!
//! Ticks are scheduled at a fixed phase: the n-th tick is due at `start + n * interval`. If the
//! loop falls behind, late ticks are run back to back until it has caught up, no tick is
//! skipped.
use eyre::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::protocol::FrameCodec;
use crate::sailbot::{SailBot, SailBotState};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// The other end of the serial link. Called once per byte from the tick loop, so it must not
/// block.
pub trait ByteSink: Send + 'static {
    fn write_byte(&mut self, b: u8);
}

impl<F> ByteSink for F
where
    F: FnMut(u8) + Send + 'static,
{
    fn write_byte(&mut self, b: u8) {
        self(b)
    }
}

/// Bytes are dropped once the receiving end is gone.
impl ByteSink for mpsc::UnboundedSender<u8> {
    fn write_byte(&mut self, b: u8) {
        self.send(b).ok();
    }
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    pub ticks: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub decode_errors: u64,
}

struct Fleet {
    bots: Vec<Mutex<SailBot>>,
    codec: Arc<dyn FrameCodec>,
    stats: Counters,
}

fn lock(bot: &Mutex<SailBot>) -> MutexGuard<'_, SailBot> {
    bot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Fleet {
    fn tick(&self, sink: &mut impl ByteSink) {
        let n = self.stats.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        for bot in &self.bots {
            let frame = {
                let mut bot = lock(bot);
                bot.tick();
                bot.encode_telemetry(&*self.codec)
            };

            for b in frame.iter() {
                sink.write_byte(*b);
            }

            self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        }

        debug!("tick {}: sent telemetry for {} bots", n, self.bots.len());
    }

    fn submit(&self, framed: &[u8]) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        match self.codec.decode(framed) {
            Ok(frame) => {
                let mut handled = 0;
                for bot in &self.bots {
                    if lock(bot).handle_frame(&frame) {
                        handled += 1;
                    }
                }

                trace!(
                    "{:?} for {}: handled by {} bots",
                    frame.payload.payload_type(),
                    frame.header.destination,
                    handled
                );
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "dropping malformed inbound frame ({} bytes): {}",
                    framed.len(),
                    e
                );
            }
        }
    }

    fn stats(&self) -> DriverStats {
        DriverStats {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle for feeding inbound frames from other tasks or threads.
#[derive(Clone)]
pub struct Inbound {
    fleet: Arc<Fleet>,
}

impl Inbound {
    /// Hand one framed message to the fleet. Malformed frames are logged and dropped.
    pub fn submit(&self, framed: &[u8]) {
        self.fleet.submit(framed)
    }
}

pub struct FleetDriver<S: ByteSink> {
    fleet: Arc<Fleet>,
    interval: Duration,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<S>>,
}

impl<S: ByteSink> FleetDriver<S> {
    /// Advertise every bot on `sink` and start the tick loop on the current tokio runtime.
    pub fn start(
        bots: Vec<SailBot>,
        interval: Duration,
        codec: impl FrameCodec + 'static,
        mut sink: S,
    ) -> Result<FleetDriver<S>> {
        ensure!(!bots.is_empty(), "fleet must contain at least one sailbot");
        ensure!(!interval.is_zero(), "tick interval must be positive");

        let rt = tokio::runtime::Handle::try_current()
            .map_err(|e| eyre!("fleet driver needs a tokio runtime: {}", e))?;

        for bot in &bots {
            debug!("advertising: {}", bot.address());
            for b in bot.advertise(&codec).iter() {
                sink.write_byte(*b);
            }
        }

        let fleet = Arc::new(Fleet {
            bots: bots.into_iter().map(Mutex::new).collect(),
            codec: Arc::new(codec),
            stats: Counters::default(),
        });

        let first = Instant::now() + interval;
        let (stop, stopped) = watch::channel(false);
        let task = rt.spawn(run(Arc::clone(&fleet), first, interval, sink, stopped));

        info!(
            "sailbot simulation started: {} bots, interval: {:?}",
            fleet.bots.len(),
            interval
        );

        Ok(FleetDriver {
            fleet,
            interval,
            stop,
            task: Some(task),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Write bytes on the fake serial line, as the gateway would.
    pub fn submit_inbound(&self, framed: &[u8]) {
        self.fleet.submit(framed)
    }

    pub fn inbound(&self) -> Inbound {
        Inbound {
            fleet: Arc::clone(&self.fleet),
        }
    }

    /// State of every bot, in fleet order.
    pub fn snapshot(&self) -> Vec<SailBotState> {
        self.fleet.bots.iter().map(|b| lock(b).state()).collect()
    }

    pub fn stats(&self) -> DriverStats {
        self.fleet.stats()
    }

    /// Stop the tick loop and hand back the sink.
    pub async fn stop(mut self) -> Result<S> {
        self.stop.send(true).ok();

        let task = self
            .task
            .take()
            .ok_or_else(|| eyre!("tick loop already stopped"))?;
        let sink = task.await?;

        info!(
            "sailbot simulation stopped after {} ticks",
            self.fleet.stats().ticks
        );

        Ok(sink)
    }
}

impl<S: ByteSink> Drop for FleetDriver<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<S: ByteSink>(
    fleet: Arc<Fleet>,
    first: Instant,
    period: Duration,
    mut sink: S,
    mut stop: watch::Receiver<bool>,
) -> S {
    let mut interval = time::interval_at(first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,
            _ = interval.tick() => fleet.tick(&mut sink),
        }
    }

    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::hdlc::HdlcDecoder;
    use crate::protocol::{Address, Frame, HdlcCodec, MoveRaw, Payload};

    type Captured = Arc<Mutex<Vec<u8>>>;

    fn capture() -> (Captured, impl ByteSink) {
        let out: Captured = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&out);
        (out, move |b: u8| o.lock().unwrap().push(b))
    }

    fn frames(bytes: &[u8]) -> Vec<Frame> {
        let mut dec = HdlcDecoder::new();
        bytes
            .iter()
            .filter_map(|b| dec.push(*b))
            .map(|f| Frame::from_bytes(&f.unwrap()).unwrap())
            .collect()
    }

    fn move_raw(destination: Address, left_x: u8, right_y: u8) -> Vec<u8> {
        let mut f = SailBot::new(destination).telemetry();
        f.header.destination = destination;
        f.payload = Payload::MoveRaw(MoveRaw {
            left_x,
            left_y: 0,
            right_x: 0,
            right_y,
        });
        HdlcCodec.encode(&f).to_vec()
    }

    fn fleet() -> Vec<SailBot> {
        vec![SailBot::new(Address(1)), SailBot::new(Address(2))]
    }

    #[tokio::test]
    async fn rejects_bad_configuration() {
        let (_, sink) = capture();
        assert!(FleetDriver::start(vec![], DEFAULT_INTERVAL, HdlcCodec, sink).is_err());

        let (out, sink) = capture();
        assert!(FleetDriver::start(fleet(), Duration::ZERO, HdlcCodec, sink).is_err());
        assert!(out.lock().unwrap().is_empty());
    }

    #[test]
    fn requires_runtime() {
        let (_, sink) = capture();
        assert!(FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, sink).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn advertises_in_fleet_order() {
        let (out, sink) = capture();
        let driver = FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, sink).unwrap();

        let f = frames(&out.lock().unwrap());
        assert_eq!(f.len(), 2);
        assert!(f.iter().all(|f| f.payload == Payload::Advertisement));
        assert_eq!(f[0].header.source, Address(1));
        assert_eq!(f[1].header.source, Address(2));

        driver.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_fixed_phase() {
        let (out, sink) = capture();
        let driver = FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, sink).unwrap();

        time::sleep(Duration::from_millis(499)).await;
        assert_eq!(driver.stats().ticks, 0);

        time::sleep(Duration::from_millis(751)).await;
        assert_eq!(driver.stats().ticks, 2);
        assert_eq!(driver.stats().frames_sent, 4);

        let f = frames(&out.lock().unwrap());
        assert_eq!(f.len(), 2 + 4);

        let sources: Vec<_> = f[2..].iter().map(|f| f.header.source).collect();
        assert_eq!(sources, vec![Address(1), Address(2), Address(1), Address(2)]);

        driver.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_ticks_are_not_skipped() {
        let (_, sink) = capture();
        let driver = FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, sink).unwrap();

        time::advance(Duration::from_millis(1600)).await;
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(driver.stats().ticks, 3);

        // next tick keeps the phase set at start
        time::sleep(Duration::from_millis(398)).await;
        assert_eq!(driver.stats().ticks, 3);
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(driver.stats().ticks, 4);

        driver.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_routed_by_address() {
        let (_, sink) = capture();
        let driver = FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, sink).unwrap();

        driver.submit_inbound(&move_raw(Address(2), 200, 50));

        let s = driver.snapshot();
        assert_eq!((s[0].rudder, s[0].sail), (0, 0));
        assert_eq!((s[1].rudder, s[1].sail), (-56, 50));

        driver.submit_inbound(&move_raw(Address(3), 1, 1));
        assert_eq!(driver.snapshot(), s);

        assert_eq!(driver.stats().frames_received, 2);
        assert_eq!(driver.stats().decode_errors, 0);

        driver.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_inbound_is_absorbed() {
        let (_, sink) = capture();
        let driver = FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, sink).unwrap();
        let s0 = driver.snapshot();

        let good = move_raw(Address(1), 200, 50);
        let inbound = driver.inbound();

        inbound.submit(&good[..good.len() / 2]);
        inbound.submit(&[]);
        inbound.submit(&[0x7e, 0x7e]);

        let mut corrupt = good.clone();
        corrupt[5] ^= 0xff;
        inbound.submit(&corrupt);

        assert_eq!(driver.snapshot(), s0);
        assert_eq!(driver.stats().decode_errors, 4);

        // the loop keeps running
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(driver.stats().ticks, 1);

        driver.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, tx).unwrap();

        time::sleep(Duration::from_millis(600)).await;
        let tx = driver.stop().await.unwrap();
        drop(tx);

        let mut bytes = Vec::new();
        while let Some(b) = rx.recv().await {
            bytes.push(b);
        }

        let f = frames(&bytes);
        assert_eq!(f.len(), 2 + 2);
        assert_eq!(f[0].payload, Payload::Advertisement);
        assert!(matches!(f[2].payload, Payload::SailBotData(_)));

        // a closed channel does not disturb the loop
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let driver = FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, tx).unwrap();
        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(driver.stats().ticks, 2);
        driver.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_the_loop() {
        let (out, sink) = capture();
        let driver = FleetDriver::start(fleet(), DEFAULT_INTERVAL, HdlcCodec, sink).unwrap();

        time::sleep(Duration::from_millis(600)).await;
        let fleet = Arc::clone(&driver.fleet);
        let _sink = driver.stop().await.unwrap();

        let sent = out.lock().unwrap().len();
        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(fleet.stats().ticks, 1);
        assert_eq!(out.lock().unwrap().len(), sent);
    }
}
