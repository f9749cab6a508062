//! Decode-feed session
//!
//! Owns the channel, the reassembler, the rate estimator and the buffer
//! arbiter, and drives the decoder capability through the session state
//! machine. Every exit path (end of stream, transport failure, malformed
//! framing, decoder failure, cancellation) goes through the same cleanup.

use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::arbiter::BufferArbiter;
use super::health::{HealthSummary, SessionHealth};
use super::rate::{Pacer, RateEstimator, millis_since};
use super::reassembler::{Discipline, FrameReassembler};
use super::state::SessionState;
use super::types::Frame;
use crate::assets::{HEALTH_LOG_INTERVAL_SECS, POINTER_EVENT_LEN};
use crate::channel::ByteChannel;
use crate::config::SessionConfig;
use crate::decoder::{DecoderCapability, DecoderEvent, DecoderNotifier, DecoderParams, nal};
use crate::display::{NullTarget, RenderTarget};
use crate::error::{ChannelError, DecoderError, Result, SessionError};

type SharedDecoder = Arc<Mutex<Box<dyn DecoderCapability>>>;

fn lock_decoder(
    decoder: &Mutex<Box<dyn DecoderCapability>>,
) -> MutexGuard<'_, Box<dyn DecoderCapability>> {
    decoder.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outcome of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub final_state: SessionState,
    /// Every state the session went through, in order.
    pub history: Vec<SessionState>,
    /// Why streaming ended; `None` for a clean end of stream.
    pub cause: Option<SessionError>,
    pub streamed_for: Option<Duration>,
    pub health: HealthSummary,
}

impl SessionReport {
    /// True for end of stream and external cancellation.
    pub fn is_clean(&self) -> bool {
        self.cause.as_ref().is_none_or(SessionError::is_cancellation)
    }
}

impl std::fmt::Display for SessionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            None => write!(f, "Session {}: end of stream", self.final_state)?,
            Some(cause) => write!(f, "Session {}: {}", self.final_state, cause)?,
        }
        if let Some(streamed) = self.streamed_for {
            write!(f, " after {:.1}s", streamed.as_secs_f64())?;
        }
        write!(f, ". {}", self.health)
    }
}

/// Control handle usable while the session runs.
#[derive(Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
    channel: Arc<dyn ByteChannel>,
}

impl SessionHandle {
    /// Stop the session. Pending reads and slot claims return promptly.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("FeedSession: cancellation requested");
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a pointer position upstream as two big-endian 32-bit coordinates.
    pub async fn send_pointer(&self, x: i32, y: i32) -> std::result::Result<(), ChannelError> {
        let mut event = [0u8; POINTER_EVENT_LEN];
        event[..4].copy_from_slice(&x.to_be_bytes());
        event[4..].copy_from_slice(&y.to_be_bytes());
        self.channel.write(&event).await?;
        Ok(())
    }
}

pub struct DecodeFeedSession {
    config: SessionConfig,
    channel: Arc<dyn ByteChannel>,
    decoder: SharedDecoder,
    target: Option<Box<dyn RenderTarget>>,
    state: SessionState,
    history: Vec<SessionState>,
    health: Arc<SessionHealth>,
    cancel: CancellationToken,
}

impl DecodeFeedSession {
    pub fn new(
        config: SessionConfig,
        channel: Arc<dyn ByteChannel>,
        decoder: Box<dyn DecoderCapability>,
        target: Box<dyn RenderTarget>,
    ) -> Self {
        Self {
            config,
            channel,
            decoder: Arc::new(Mutex::new(decoder)),
            target: Some(target),
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            health: Arc::new(SessionHealth::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
            channel: self.channel.clone(),
        }
    }

    pub fn health(&self) -> Arc<SessionHealth> {
        self.health.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion and release every resource.
    pub async fn run(mut self) -> SessionReport {
        info!(
            "FeedSession: starting on {} ({}, {}x{})",
            self.channel.describe(),
            self.config.codec,
            self.config.width,
            self.config.height
        );
        self.transition(SessionState::Connecting);

        let stop = self.cancel.child_token();
        let mut arbiter = BufferArbiter::new(self.config.slot_capacity, stop.clone());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let notifier = DecoderNotifier::new(arbiter.notifier(), event_tx);
        let fault = Arc::new(Mutex::new(None));

        let mut pump = None;
        let result = match self.start_decoder(notifier) {
            Err(e) => {
                error!("FeedSession: decoder failed to start: {}", e);
                Err(SessionError::from(e))
            }
            Ok(()) => {
                self.transition(SessionState::Streaming {
                    started_at: Instant::now(),
                });
                pump = Some(tokio::spawn(render_pump(
                    event_rx,
                    self.decoder.clone(),
                    self.health.clone(),
                    fault.clone(),
                    stop.clone(),
                    self.config.default_frame_rate,
                )));
                self.stream(&mut arbiter, &stop).await
            }
        };

        // A decoder failure stops the feed loop through the shared token
        let result = match result {
            Err(SessionError::Cancelled) => {
                match fault.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    Some(e) => Err(SessionError::Decoder(e)),
                    None => Err(SessionError::Cancelled),
                }
            }
            other => other,
        };
        match &result {
            Ok(()) => info!("FeedSession: stream ended"),
            Err(e) if e.is_cancellation() => info!("FeedSession: cancelled"),
            Err(e) => error!("FeedSession: {}", e),
        }

        let streamed_for = self.state.streaming_duration();
        self.transition(SessionState::Draining);
        stop.cancel();
        if let Some(pump) = pump {
            if pump.await.is_err() {
                warn!("FeedSession: render pump panicked");
            }
        }
        self.cleanup(&mut arbiter).await;
        self.transition(SessionState::Closed);

        let report = SessionReport {
            final_state: self.state,
            history: self.history,
            cause: result.err(),
            streamed_for,
            health: self.health.summary(),
        };
        info!("FeedSession: {}", report);
        report
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(&next) {
            warn!(
                "FeedSession: ignoring invalid transition {} -> {}",
                self.state, next
            );
            return;
        }
        debug!("FeedSession: {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    fn start_decoder(&mut self, notifier: DecoderNotifier) -> std::result::Result<(), DecoderError> {
        let params = DecoderParams {
            codec: self.config.codec,
            width: self.config.width,
            height: self.config.height,
            max_input_size: self.config.max_frame_size,
            input_slots: self.config.slot_capacity,
        };
        let target = self
            .target
            .take()
            .unwrap_or_else(|| Box::new(NullTarget::new()));

        let mut decoder = lock_decoder(&self.decoder);
        decoder.configure(params, target, notifier)?;
        decoder.start()?;
        info!("FeedSession: {} started", decoder.name());
        Ok(())
    }

    async fn stream(&self, arbiter: &mut BufferArbiter, stop: &CancellationToken) -> Result<()> {
        let discipline = self.channel.kind().discipline();
        let read_size = match discipline {
            Discipline::LengthPrefixed => self.config.socket_read_size,
            Discipline::ShortRead => self.config.accessory_read_size,
        };
        let mut reassembler =
            FrameReassembler::new(discipline, read_size, self.config.max_frame_size);
        let mut feed = FeedState {
            clock: Instant::now(),
            rate: RateEstimator::new(0, self.config.default_frame_rate),
            pacer: Pacer::new(self.config.pts_mode, discipline.first_frame_index()),
            waiting_for_keyframe: true,
        };
        let mut buf = vec![0u8; read_size];
        let mut last_health_log = Instant::now();

        info!(
            "FeedSession: streaming from {} ({} framing)",
            self.channel.describe(),
            discipline
        );

        loop {
            let outcome = tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(SessionError::Cancelled),
                outcome = self.channel.read(&mut buf) => match outcome {
                    Err(ChannelError::Closed) if stop.is_cancelled() => {
                        return Err(SessionError::Cancelled)
                    }
                    other => other?,
                },
            };

            if outcome.eof {
                let pending = reassembler.pending_bytes();
                if pending > 0 {
                    warn!(
                        "FeedSession: discarding {} bytes of an incomplete frame",
                        pending
                    );
                }
                return Ok(());
            }
            if outcome.bytes_read == 0 {
                continue;
            }

            let pushed = reassembler.push(&buf[..outcome.bytes_read]);
            self.health.set_keepalives(reassembler.keepalives());
            for frame in pushed.frames {
                self.feed_frame(frame, arbiter, &mut feed).await?;
            }
            if let Some(err) = pushed.error {
                return Err(err.into());
            }

            if last_health_log.elapsed() >= Duration::from_secs(HEALTH_LOG_INTERVAL_SECS) {
                info!("FeedSession: {}", self.health.summary());
                last_health_log = Instant::now();
            }
        }
    }

    /// Claim a slot, copy the frame in and submit it with its timestamp.
    async fn feed_frame(
        &self,
        frame: Frame,
        arbiter: &mut BufferArbiter,
        feed: &mut FeedState,
    ) -> Result<()> {
        let wait_start = Instant::now();
        // An external close must also end a wait for a free slot
        let slot = tokio::select! {
            biased;
            _ = self.channel.closed() => return Err(ChannelError::Closed.into()),
            slot = arbiter.claim() => slot?,
        };
        self.health.record_slot_wait(wait_start.elapsed());

        let now = millis_since(feed.clock);
        feed.rate.record_frame(now);
        let pts = feed.pacer.next_timestamp(feed.rate.effective_rate(now));

        let is_keyframe = nal::is_keyframe(self.config.codec, frame.as_bytes());
        if feed.waiting_for_keyframe && is_keyframe {
            feed.waiting_for_keyframe = false;
            info!(
                "FeedSession: first keyframe after {} frames",
                self.health.frames_submitted()
            );
        }

        {
            let mut decoder = lock_decoder(&self.decoder);
            let input = decoder.input_slot_buffer(slot)?;
            if frame.len() > input.len() {
                return Err(DecoderError::SlotOverflow {
                    len: frame.len(),
                    capacity: input.len(),
                }
                .into());
            }
            input[..frame.len()].copy_from_slice(frame.as_bytes());
            decoder.submit(slot, frame.len(), pts)?;
        }

        self.health.record_frame(frame.len(), is_keyframe);
        Ok(())
    }

    async fn cleanup(&self, arbiter: &mut BufferArbiter) {
        let abandoned = arbiter.close();

        // Stopping may join decoder threads still finishing queued input
        let decoder = self.decoder.clone();
        let shutdown = tokio::task::spawn_blocking(move || {
            let mut decoder = lock_decoder(&decoder);
            let name = decoder.name();
            if let Err(e) = decoder.stop() {
                warn!("FeedSession: failed to stop {}: {}", name, e);
            }
            decoder.release();
        });
        if shutdown.await.is_err() {
            warn!("FeedSession: decoder shutdown panicked");
        }

        self.channel.close();
        debug!(
            "FeedSession: resources released ({} free slots abandoned)",
            abandoned
        );
    }
}

/// Per-stream pacing state of the feed loop.
struct FeedState {
    clock: Instant,
    rate: RateEstimator,
    pacer: Pacer,
    waiting_for_keyframe: bool,
}

/// Handles decoder events: renders ready output, logs format changes, and
/// turns a decoder error into session termination.
async fn render_pump(
    mut events: mpsc::UnboundedReceiver<DecoderEvent>,
    decoder: SharedDecoder,
    health: Arc<SessionHealth>,
    fault: Arc<Mutex<Option<DecoderError>>>,
    stop: CancellationToken,
    default_rate: u32,
) {
    let clock = Instant::now();
    let mut output_rate = RateEstimator::new(0, default_rate);
    let mut last_rate = 0;

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            DecoderEvent::OutputAvailable(handle) => {
                let released = lock_decoder(&decoder).release_output(handle, true);
                match released {
                    Ok(()) => {
                        health.record_render();
                        let now = millis_since(clock);
                        output_rate.record_frame(now);
                        let rate = output_rate.current_rate(now);
                        if rate != last_rate {
                            debug!("FeedSession: rendering at {} fps", rate);
                            last_rate = rate;
                        }
                    }
                    Err(e) => {
                        health.record_decoder_error();
                        warn!("FeedSession: failed to render {}: {}", handle, e);
                    }
                }
            }
            DecoderEvent::FormatChanged { width, height } => {
                info!("FeedSession: output format changed to {}x{}", width, height);
            }
            DecoderEvent::Error(e) => {
                health.record_decoder_error();
                error!("FeedSession: decoder reported {}", e);
                fault
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .get_or_insert(e);
                stop.cancel();
                break;
            }
        }
    }
    debug!("FeedSession: render pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::channel::scripted::{ScriptedChannel, Step};
    use crate::config::PtsMode;
    use crate::pipeline::reassembler::encode_frame;
    use crate::pipeline::types::{BufferSlot, Timestamp};
    use crate::decoder::OutputHandle;
    use crate::error::ProtocolError;
    use std::io::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockRecord {
        submitted: Mutex<Vec<(Vec<u8>, Timestamp)>>,
        rendered: AtomicUsize,
        stops: AtomicUsize,
        releases: AtomicUsize,
    }

    impl MockRecord {
        fn payloads(&self) -> Vec<Vec<u8>> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .map(|(data, _)| data.clone())
                .collect()
        }

        fn timestamps(&self) -> Vec<i64> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .map(|(_, pts)| pts.micros)
                .collect()
        }
    }

    #[derive(Default, Clone, Copy)]
    struct MockBehaviour {
        recycle_slots: bool,
        emit_outputs: bool,
        fail_configure: bool,
        error_on_submit: Option<usize>,
        stop_delay: Option<Duration>,
    }

    /// Decoder that records submissions and frees slots immediately.
    struct MockDecoder {
        record: Arc<MockRecord>,
        behaviour: MockBehaviour,
        slots: Vec<Vec<u8>>,
        notifier: Option<DecoderNotifier>,
        next_output: u64,
    }

    impl MockDecoder {
        fn new(behaviour: MockBehaviour) -> (Box<dyn DecoderCapability>, Arc<MockRecord>) {
            let record = Arc::new(MockRecord::default());
            let decoder = MockDecoder {
                record: record.clone(),
                behaviour,
                slots: Vec::new(),
                notifier: None,
                next_output: 0,
            };
            (Box::new(decoder), record)
        }
    }

    impl DecoderCapability for MockDecoder {
        fn configure(
            &mut self,
            params: DecoderParams,
            _target: Box<dyn RenderTarget>,
            notifier: DecoderNotifier,
        ) -> std::result::Result<(), DecoderError> {
            if self.behaviour.fail_configure {
                return Err(DecoderError::Configure("unsupported codec".into()));
            }
            self.slots = vec![vec![0; params.max_input_size]; params.input_slots];
            self.notifier = Some(notifier);
            Ok(())
        }

        fn start(&mut self) -> std::result::Result<(), DecoderError> {
            let notifier = self.notifier.as_ref().ok_or(DecoderError::NotStarted)?;
            for i in 0..self.slots.len() {
                notifier.try_input_free(BufferSlot(i as u32)).unwrap();
            }
            Ok(())
        }

        fn input_slot_buffer(
            &mut self,
            slot: BufferSlot,
        ) -> std::result::Result<&mut [u8], DecoderError> {
            self.slots
                .get_mut(slot.0 as usize)
                .map(|buf| buf.as_mut_slice())
                .ok_or(DecoderError::UnknownSlot(slot.0))
        }

        fn submit(
            &mut self,
            slot: BufferSlot,
            len: usize,
            pts: Timestamp,
        ) -> std::result::Result<(), DecoderError> {
            let data = self.slots[slot.0 as usize][..len].to_vec();
            let count = {
                let mut submitted = self.record.submitted.lock().unwrap();
                submitted.push((data, pts));
                submitted.len()
            };
            let notifier = self.notifier.as_ref().ok_or(DecoderError::NotStarted)?;
            if self.behaviour.recycle_slots {
                notifier.try_input_free(slot).unwrap();
            }
            if self.behaviour.emit_outputs {
                notifier.output_available(OutputHandle(self.next_output));
                self.next_output += 1;
            }
            if self.behaviour.error_on_submit == Some(count) {
                notifier.error(DecoderError::Internal("corrupt bitstream".into()));
            }
            Ok(())
        }

        fn release_output(
            &mut self,
            _handle: OutputHandle,
            render: bool,
        ) -> std::result::Result<(), DecoderError> {
            if render {
                self.record.rendered.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn stop(&mut self) -> std::result::Result<(), DecoderError> {
            if let Some(delay) = self.behaviour.stop_delay {
                std::thread::sleep(delay);
            }
            self.record.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self) {
            self.record.releases.fetch_add(1, Ordering::SeqCst);
            self.notifier = None;
        }

        fn name(&self) -> &'static str {
            "MockDecoder"
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            max_frame_size: 1024,
            slot_capacity: 4,
            socket_read_size: 64,
            accessory_read_size: 8,
            pts_mode: PtsMode::Paced {
                multiplier: 1_000_000,
            },
            ..SessionConfig::default()
        }
    }

    fn wire(payloads: &[&[u8]]) -> Vec<u8> {
        payloads
            .iter()
            .flat_map(|p| encode_frame(p).unwrap().to_vec())
            .collect()
    }

    fn session(
        config: SessionConfig,
        kind: ChannelKind,
        steps: Vec<Step>,
        behaviour: MockBehaviour,
    ) -> (DecodeFeedSession, Arc<ScriptedChannel>, Arc<MockRecord>) {
        let channel = Arc::new(ScriptedChannel::new(kind, steps));
        let (decoder, record) = MockDecoder::new(behaviour);
        let session = DecodeFeedSession::new(
            config,
            channel.clone(),
            decoder,
            Box::new(NullTarget::new()),
        );
        (session, channel, record)
    }

    fn recycling() -> MockBehaviour {
        MockBehaviour {
            recycle_slots: true,
            ..MockBehaviour::default()
        }
    }

    fn assert_cleaned_up(report: &SessionReport, channel: &ScriptedChannel, record: &MockRecord) {
        assert_eq!(report.final_state, SessionState::Closed);
        assert_eq!(record.stops.load(Ordering::SeqCst), 1);
        assert_eq!(record.releases.load(Ordering::SeqCst), 1);
        assert_eq!(channel.close_calls(), 1);
    }

    fn state_names(report: &SessionReport) -> Vec<&'static str> {
        report.history.iter().map(|s| s.description()).collect()
    }

    #[tokio::test]
    async fn test_streams_until_end_of_stream() {
        let big = vec![0xABu8; 200];
        let bytes = wire(&[&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], &big, &[7, 7, 7, 7, 7]]);
        let (session, channel, record) =
            session(test_config(), ChannelKind::Socket, vec![Step::Data(bytes)], recycling());

        let report = session.run().await;

        assert!(report.cause.is_none());
        assert!(report.is_clean());
        assert_eq!(
            state_names(&report),
            vec!["Idle", "Connecting", "Streaming", "Draining", "Closed"]
        );
        assert_eq!(
            record.payloads(),
            vec![vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10], big, vec![7, 7, 7, 7, 7]]
        );
        // No published rate yet: the default of 30 fps paces frames 1, 2, 3
        assert_eq!(record.timestamps(), vec![33_333, 66_666, 100_000]);
        assert_eq!(report.health.frames_submitted, 3);
        assert_eq!(report.health.bytes_submitted, 215);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_keepalives_and_empty_reads() {
        let mut bytes = vec![0, 0, 0, 0];
        bytes.extend(wire(&[&[0x42; 3]]));
        bytes.extend([0, 0, 0, 0]);
        let steps = vec![Step::Empty, Step::Data(bytes), Step::Empty, Step::Empty];
        let (session, channel, record) =
            session(test_config(), ChannelKind::Socket, steps, recycling());

        let report = session.run().await;

        assert!(report.cause.is_none());
        assert_eq!(record.payloads(), vec![vec![0x42; 3]]);
        assert_eq!(report.health.keepalives, 2);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_channel_error_mid_stream() {
        let steps = vec![
            Step::Data(wire(&[&[1, 1]])),
            Step::Data(vec![0, 0, 0, 9, 1, 2]),
            Step::Fail(ErrorKind::ConnectionReset),
            Step::Data(wire(&[&[2, 2]])),
        ];
        let (session, channel, record) =
            session(test_config(), ChannelKind::Socket, steps, recycling());

        let report = session.run().await;

        assert!(matches!(report.cause, Some(SessionError::Channel(ChannelError::Io(_)))));
        assert!(!report.is_clean());
        assert_eq!(record.payloads(), vec![vec![1, 1]]);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_oversized_length_is_fatal() {
        // A good frame, then 1025 > max_frame_size of 1024 in the same read
        let mut bytes = wire(&[&[5; 4]]);
        bytes.extend([0x00, 0x00, 0x04, 0x01, 9, 9, 9]);
        bytes.extend(wire(&[&[6; 4]]));
        let steps = vec![Step::Data(bytes), Step::Data(wire(&[&[7; 4]]))];
        let (session, channel, record) =
            session(test_config(), ChannelKind::Socket, steps, recycling());

        let report = session.run().await;

        assert!(matches!(
            report.cause,
            Some(SessionError::Protocol(ProtocolError::FrameTooLarge {
                len: 1025,
                max: 1024
            }))
        ));
        assert_eq!(record.payloads(), vec![vec![5; 4]]);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_slot() {
        let config = SessionConfig {
            slot_capacity: 2,
            ..test_config()
        };
        let bytes = wire(&[&[1], &[2], &[3]]);
        // Slots are never recycled: the third frame waits for a slot forever
        let (session, channel, record) = session(
            config,
            ChannelKind::Socket,
            vec![Step::Data(bytes)],
            MockBehaviour::default(),
        );

        let handle = session.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .expect("session did not stop after cancellation");

        assert!(matches!(report.cause, Some(SessionError::Cancelled)));
        assert!(report.is_clean());
        assert_eq!(record.payloads(), vec![vec![1], vec![2]]);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_channel_close_while_waiting_for_slot() {
        let config = SessionConfig {
            slot_capacity: 2,
            ..test_config()
        };
        let bytes = wire(&[&[1], &[2], &[3]]);
        let (session, channel, record) = session(
            config,
            ChannelKind::Socket,
            vec![Step::Data(bytes)],
            MockBehaviour::default(),
        );

        let closer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closer.close();
        });

        let report = tokio::time::timeout(Duration::from_secs(2), session.run())
            .await
            .expect("session did not stop after the channel was closed");

        assert!(matches!(
            report.cause,
            Some(SessionError::Channel(ChannelError::Closed))
        ));
        assert!(!report.is_clean());
        assert_eq!(report.final_state, SessionState::Closed);
        assert_eq!(record.payloads(), vec![vec![1], vec![2]]);
        assert_eq!(record.stops.load(Ordering::SeqCst), 1);
        assert_eq!(record.releases.load(Ordering::SeqCst), 1);
        // Once from outside, once by cleanup
        assert_eq!(channel.close_calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_while_reading() {
        let steps = vec![Step::Data(wire(&[&[1, 2]])), Step::Stall];
        let (session, channel, record) =
            session(test_config(), ChannelKind::Socket, steps, recycling());

        let handle = session.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .expect("session did not stop after cancellation");

        assert!(matches!(report.cause, Some(SessionError::Cancelled)));
        assert_eq!(record.payloads().len(), 1);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_configure_failure_still_cleans_up() {
        let behaviour = MockBehaviour {
            fail_configure: true,
            ..MockBehaviour::default()
        };
        let (session, channel, record) = session(
            test_config(),
            ChannelKind::Socket,
            vec![Step::Data(wire(&[&[1]]))],
            behaviour,
        );

        let report = session.run().await;

        assert!(matches!(
            report.cause,
            Some(SessionError::Decoder(DecoderError::Configure(_)))
        ));
        assert_eq!(
            state_names(&report),
            vec!["Idle", "Connecting", "Draining", "Closed"]
        );
        assert!(report.streamed_for.is_none());
        assert!(record.payloads().is_empty());
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_decoder_error_ends_session() {
        let behaviour = MockBehaviour {
            recycle_slots: true,
            error_on_submit: Some(2),
            ..MockBehaviour::default()
        };
        let steps = vec![Step::Data(wire(&[&[1], &[2]])), Step::Stall];
        let (session, channel, record) =
            session(test_config(), ChannelKind::Socket, steps, behaviour);

        let report = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .expect("decoder error did not stop the session");

        assert!(matches!(
            report.cause,
            Some(SessionError::Decoder(DecoderError::Internal(_)))
        ));
        assert_eq!(report.health.decoder_errors, 1);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_outputs_are_rendered() {
        let behaviour = MockBehaviour {
            recycle_slots: true,
            emit_outputs: true,
            ..MockBehaviour::default()
        };
        let steps = vec![Step::Data(wire(&[&[1], &[2], &[3]])), Step::Stall];
        let (session, channel, record) =
            session(test_config(), ChannelKind::Socket, steps, behaviour);

        let health = session.health();
        let handle = session.handle();
        tokio::spawn(async move {
            while health.frames_rendered() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            handle.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .expect("outputs were never rendered");

        assert_eq!(report.health.frames_rendered, 3);
        assert_eq!(record.rendered.load(Ordering::SeqCst), 3);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_accessory_short_read_framing() {
        let first: Vec<u8> = (0..20).collect();
        let second: Vec<u8> = (100..111).collect();
        let steps = vec![
            // 8 + 8 + 4: the short read ends the frame
            Step::Data(first.clone()),
            Step::Data(second[..8].to_vec()),
            Step::Data(second[8..].to_vec()),
        ];
        let (session, channel, record) =
            session(test_config(), ChannelKind::Accessory, steps, recycling());

        let report = session.run().await;

        assert!(report.cause.is_none());
        assert_eq!(record.payloads(), vec![first, second]);
        // USB frames are counted from 0
        assert_eq!(record.timestamps(), vec![0, 33_333]);
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_blocking_stop_leaves_runtime_free() {
        let behaviour = MockBehaviour {
            stop_delay: Some(Duration::from_millis(300)),
            ..recycling()
        };
        let (session, channel, record) = session(
            test_config(),
            ChannelKind::Socket,
            vec![Step::Data(wire(&[&[1]]))],
            behaviour,
        );

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let report = session.run().await;
        ticker.abort();

        // The single-threaded test runtime kept running while stop blocked
        assert!(ticks.load(Ordering::SeqCst) >= 5);
        assert!(report.cause.is_none());
        assert_cleaned_up(&report, &channel, &record);
    }

    #[tokio::test]
    async fn test_pointer_uplink() {
        let (session, channel, _record) =
            session(test_config(), ChannelKind::Socket, vec![], recycling());

        let handle = session.handle();
        handle.send_pointer(100, -2).await.unwrap();
        assert_eq!(
            channel.written(),
            vec![0, 0, 0, 100, 0xFF, 0xFF, 0xFF, 0xFE]
        );

        session.run().await;
        assert!(handle.send_pointer(1, 1).await.is_err());
    }
}
