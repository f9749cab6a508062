//! Video decoder capability
//!
//! The feed session drives a decoder through [`DecoderCapability`]: it fills
//! input slots and submits them, while the decoder reports back asynchronously
//! through a [`DecoderNotifier`] (free input slots go to the buffer arbiter,
//! everything else becomes a [`DecoderEvent`]).

#[cfg(feature = "ffmpeg")]
mod ffmpeg;
pub mod nal;

use log::warn;
use tokio::sync::mpsc;

use crate::config::CodecKind;
use crate::display::RenderTarget;
use crate::error::DecoderError;
use crate::pipeline::arbiter::{NotifyError, SlotNotifier};
use crate::pipeline::types::{BufferSlot, Timestamp};

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegDecoder;

/// Decoded video frame with raw pixel data.
///
/// `data` holds packed YUV420p planes (Y, then U, then V) without stride padding.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pts: Timestamp,
}

/// Handle of a decoded output buffer held by the decoder until released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputHandle(pub u64);

impl std::fmt::Display for OutputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "output#{}", self.0)
    }
}

/// Stream parameters the decoder is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderParams {
    pub codec: CodecKind,
    pub width: u32,
    pub height: u32,
    /// Capacity of every input slot; no frame submitted is larger.
    pub max_input_size: usize,
    /// Number of input slots the decoder announces.
    pub input_slots: usize,
}

/// Asynchronous notifications besides "input slot free".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderEvent {
    /// A decoded frame is ready and must be released with `release_output`.
    OutputAvailable(OutputHandle),
    /// The decoded picture size changed.
    FormatChanged { width: u32, height: u32 },
    /// The decoder failed; the session cannot continue.
    Error(DecoderError),
}

/// Callback side handed to the decoder at configuration time.
#[derive(Clone)]
pub struct DecoderNotifier {
    slots: SlotNotifier,
    events: mpsc::UnboundedSender<DecoderEvent>,
}

impl DecoderNotifier {
    pub fn new(slots: SlotNotifier, events: mpsc::UnboundedSender<DecoderEvent>) -> Self {
        Self { slots, events }
    }

    /// Announce a free input slot from a decoder-owned thread, waiting while
    /// the arbiter queue is full.
    ///
    /// Returns false once the session stopped accepting slots.
    pub fn input_free(&self, slot: BufferSlot) -> bool {
        self.slots.notify_free(slot).is_ok()
    }

    /// Announce a free input slot without waiting. Safe to call from async code.
    pub fn try_input_free(&self, slot: BufferSlot) -> Result<bool, NotifyError> {
        self.slots.try_notify_free(slot)
    }

    pub fn output_available(&self, handle: OutputHandle) -> bool {
        self.send(DecoderEvent::OutputAvailable(handle))
    }

    pub fn format_changed(&self, width: u32, height: u32) -> bool {
        self.send(DecoderEvent::FormatChanged { width, height })
    }

    pub fn error(&self, err: DecoderError) -> bool {
        self.send(DecoderEvent::Error(err))
    }

    fn send(&self, event: DecoderEvent) -> bool {
        match self.events.send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!("Decoder: event dropped, session gone ({:?})", e.0);
                false
            }
        }
    }
}

/// Hardware or software video decoder driven by the feed session.
///
/// Call order: `configure`, `start`, then any number of
/// `input_slot_buffer`/`submit` and `release_output`, then `stop` and
/// `release`. Input slots are announced free through the notifier given to
/// `configure`; a slot is only written between being claimed and submitted.
pub trait DecoderCapability: Send {
    fn configure(
        &mut self,
        params: DecoderParams,
        target: Box<dyn RenderTarget>,
        notifier: DecoderNotifier,
    ) -> Result<(), DecoderError>;

    /// Start decoding and announce the initial set of free input slots.
    fn start(&mut self) -> Result<(), DecoderError>;

    /// Writable memory behind an input slot.
    fn input_slot_buffer(&mut self, slot: BufferSlot) -> Result<&mut [u8], DecoderError>;

    /// Queue the first `len` bytes of `slot` for decoding.
    fn submit(&mut self, slot: BufferSlot, len: usize, pts: Timestamp)
    -> Result<(), DecoderError>;

    /// Give an output buffer back, presenting it on the render target first if `render`.
    fn release_output(&mut self, handle: OutputHandle, render: bool) -> Result<(), DecoderError>;

    fn stop(&mut self) -> Result<(), DecoderError>;

    /// Free every decoder resource. The decoder is unusable afterwards.
    fn release(&mut self);

    fn name(&self) -> &'static str;
}
