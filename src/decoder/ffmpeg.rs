use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::codec::video::{VideoDecoder, VideoFrame as FfmpegFrame};
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp as FfmpegTimestamp};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::{DecoderCapability, DecoderNotifier, DecoderParams, OutputHandle, VideoFrame};
use crate::display::RenderTarget;
use crate::error::DecoderError;
use crate::pipeline::types::{BufferSlot, Timestamp};

/// Consecutive undecodable frames tolerated before the decoder reports failure.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

type OutputMap = Arc<Mutex<HashMap<OutputHandle, VideoFrame>>>;

enum Command {
    Decode {
        slot: BufferSlot,
        data: Vec<u8>,
        len: usize,
        pts: Timestamp,
    },
    Stop,
}

/// H.264 / H.265 decoder capability backed by FFmpeg.
///
/// Decoding runs on a dedicated worker thread that owns the FFmpeg context.
/// Input slots are plain byte buffers: a submitted slot's buffer moves to the
/// worker and comes back once the packet was consumed, after which the slot
/// is announced free again.
pub struct FfmpegDecoder {
    params: Option<DecoderParams>,
    target: Option<Box<dyn RenderTarget>>,
    notifier: Option<DecoderNotifier>,
    slots: Vec<Option<Vec<u8>>>,
    returned: Option<Receiver<(BufferSlot, Vec<u8>)>>,
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    outputs: OutputMap,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self {
            params: None,
            target: None,
            notifier: None,
            slots: Vec::new(),
            returned: None,
            commands: None,
            worker: None,
            outputs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Move buffers handed back by the worker into their slots.
    fn reclaim(&mut self) {
        if let Some(returned) = &self.returned {
            while let Ok((slot, data)) = returned.try_recv() {
                if let Some(entry) = self.slots.get_mut(slot.0 as usize) {
                    *entry = Some(data);
                }
            }
        }
    }

    fn outputs(&self) -> MutexGuard<'_, HashMap<OutputHandle, VideoFrame>> {
        self.outputs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn build_decoder(codec: &str) -> Result<VideoDecoder, ac_ffmpeg::Error> {
    VideoDecoder::builder(codec)?
        .time_base(TimeBase::new(1, 1_000_000))
        .build()
}

impl DecoderCapability for FfmpegDecoder {
    fn configure(
        &mut self,
        params: DecoderParams,
        target: Box<dyn RenderTarget>,
        notifier: DecoderNotifier,
    ) -> Result<(), DecoderError> {
        VideoDecoder::builder(params.codec.ffmpeg_name())
            .map_err(|e| DecoderError::Configure(format!("{}: {}", params.codec, e)))?;

        info!(
            "FfmpegDecoder: configured {} {}x{}, {} input slots of {} bytes, rendering to {}",
            params.codec,
            params.width,
            params.height,
            params.input_slots,
            params.max_input_size,
            target.describe()
        );
        self.slots = (0..params.input_slots)
            .map(|_| Some(vec![0u8; params.max_input_size]))
            .collect();
        self.params = Some(params);
        self.target = Some(target);
        self.notifier = Some(notifier);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        let (params, notifier) = match (self.params, self.notifier.clone()) {
            (Some(params), Some(notifier)) => (params, notifier),
            _ => return Err(DecoderError::Configure("decoder not configured".into())),
        };

        let (command_tx, command_rx) = mpsc::channel();
        let (returned_tx, returned_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let worker_notifier = notifier.clone();
        let outputs = self.outputs.clone();
        let codec = params.codec.ffmpeg_name();

        let worker = thread::Builder::new()
            .name("ffmpeg-decoder".into())
            .spawn(move || {
                let decoder = match build_decoder(codec) {
                    Ok(decoder) => {
                        let _ = ready_tx.send(Ok(()));
                        decoder
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                DecodeWorker {
                    decoder,
                    notifier: worker_notifier,
                    returned: returned_tx,
                    outputs,
                    next_handle: 0,
                    dims: None,
                    consecutive_failures: 0,
                }
                .run(command_rx);
            })
            .map_err(|e| DecoderError::Internal(format!("failed to spawn decoder thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                let _ = worker.join();
                return Err(DecoderError::Configure(msg));
            }
            Err(_) => {
                let _ = worker.join();
                return Err(DecoderError::Internal("decoder thread exited".into()));
            }
        }

        self.commands = Some(command_tx);
        self.returned = Some(returned_rx);
        self.worker = Some(worker);

        for index in 0..self.slots.len() {
            notifier
                .try_input_free(BufferSlot(index as u32))
                .map_err(|e| DecoderError::Internal(e.to_string()))?;
        }
        info!("FfmpegDecoder: started");
        Ok(())
    }

    fn input_slot_buffer(&mut self, slot: BufferSlot) -> Result<&mut [u8], DecoderError> {
        if self.commands.is_none() {
            return Err(DecoderError::NotStarted);
        }
        self.reclaim();
        self.slots
            .get_mut(slot.0 as usize)
            .ok_or(DecoderError::UnknownSlot(slot.0))?
            .as_deref_mut()
            .ok_or_else(|| DecoderError::Internal(format!("{} is still being decoded", slot)))
    }

    fn submit(&mut self, slot: BufferSlot, len: usize, pts: Timestamp) -> Result<(), DecoderError> {
        if self.commands.is_none() {
            return Err(DecoderError::NotStarted);
        }
        self.reclaim();
        let entry = self
            .slots
            .get_mut(slot.0 as usize)
            .ok_or(DecoderError::UnknownSlot(slot.0))?;
        let data = entry
            .take()
            .ok_or_else(|| DecoderError::Internal(format!("{} submitted twice", slot)))?;
        if len > data.len() {
            let capacity = data.len();
            *entry = Some(data);
            return Err(DecoderError::SlotOverflow { len, capacity });
        }

        let sent = self
            .commands
            .as_ref()
            .map(|tx| tx.send(Command::Decode { slot, data, len, pts }).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(DecoderError::Internal("decoder thread is gone".into()));
        }
        Ok(())
    }

    fn release_output(&mut self, handle: OutputHandle, render: bool) -> Result<(), DecoderError> {
        let frame = self
            .outputs()
            .remove(&handle)
            .ok_or(DecoderError::UnknownOutput(handle.0))?;
        if render {
            if let Some(target) = self.target.as_mut() {
                target
                    .present(&frame)
                    .map_err(|e| DecoderError::Internal(format!("render failed: {:#}", e)))?;
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DecoderError> {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Stop);
        }
        let joined = match self.worker.take() {
            Some(worker) => worker.join().is_ok(),
            None => true,
        };
        let dropped = {
            let mut outputs = self.outputs();
            let n = outputs.len();
            outputs.clear();
            n
        };
        if dropped > 0 {
            debug!("FfmpegDecoder: dropped {} unreleased outputs", dropped);
        }
        info!("FfmpegDecoder: stopped");
        if joined {
            Ok(())
        } else {
            Err(DecoderError::Internal("decoder thread panicked".into()))
        }
    }

    fn release(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
        self.slots.clear();
        self.returned = None;
        self.target = None;
        self.notifier = None;
        self.params = None;
        debug!("FfmpegDecoder: released");
    }

    fn name(&self) -> &'static str {
        "FfmpegDecoder"
    }
}

/// State owned by the decoder thread.
struct DecodeWorker {
    decoder: VideoDecoder,
    notifier: DecoderNotifier,
    returned: Sender<(BufferSlot, Vec<u8>)>,
    outputs: OutputMap,
    next_handle: u64,
    dims: Option<(u32, u32)>,
    consecutive_failures: u32,
}

impl DecodeWorker {
    fn run(mut self, commands: Receiver<Command>) {
        while let Ok(command) = commands.recv() {
            let Command::Decode {
                slot,
                data,
                len,
                pts,
            } = command
            else {
                break;
            };

            let result = self.decode(&data[..len], pts);
            if self.returned.send((slot, data)).is_err() || !self.notifier.input_free(slot) {
                break;
            }

            match result {
                Ok(()) => self.consecutive_failures = 0,
                Err(e) => {
                    self.consecutive_failures += 1;
                    warn!("FfmpegDecoder: {}", e);
                    if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        self.notifier.error(e);
                        self.consecutive_failures = 0;
                    }
                }
            }
        }
        debug!("FfmpegDecoder: worker exiting");
    }

    fn decode(&mut self, data: &[u8], pts: Timestamp) -> Result<(), DecoderError> {
        let packet = || {
            PacketMut::from(data)
                .with_pts(FfmpegTimestamp::from_micros(pts.micros))
                .freeze()
        };

        if self.decoder.try_push(packet()).is_err() {
            // Decoder full: take pending frames and retry once
            self.drain()?;
            if self.decoder.try_push(packet()).is_err() {
                return Err(DecoderError::Internal(format!(
                    "packet of {} bytes rejected",
                    data.len()
                )));
            }
        }
        self.drain()
    }

    fn drain(&mut self) -> Result<(), DecoderError> {
        while let Some(frame) = self
            .decoder
            .take()
            .map_err(|e| DecoderError::Internal(e.to_string()))?
        {
            self.emit(frame);
        }
        Ok(())
    }

    fn emit(&mut self, frame: FfmpegFrame) {
        let w = frame.width();
        let h = frame.height();
        let dims = (w as u32, h as u32);
        if self.dims != Some(dims) {
            self.dims = Some(dims);
            self.notifier.format_changed(dims.0, dims.1);
        }

        let planes = frame.planes();
        let (uw, uh) = (w / 2, h / 2);
        let mut data = vec![0u8; w * h + uw * uh * 2];
        pack_yuv420(
            &mut data,
            Plane {
                data: planes[0].data(),
                stride: planes[0].line_size(),
                width: w,
                height: h,
            },
            Plane {
                data: planes[1].data(),
                stride: planes[1].line_size(),
                width: uw,
                height: uh,
            },
            Plane {
                data: planes[2].data(),
                stride: planes[2].line_size(),
                width: uw,
                height: uh,
            },
        );

        let pts = frame
            .pts()
            .as_micros()
            .map(Timestamp::from_micros)
            .unwrap_or_default();
        let handle = OutputHandle(self.next_handle);
        self.next_handle += 1;
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                handle,
                VideoFrame {
                    data,
                    width: dims.0,
                    height: dims.1,
                    pts,
                },
            );
        self.notifier.output_available(handle);
    }
}

#[derive(Clone, Copy)]
struct Plane<'a> {
    data: &'a [u8],
    stride: usize,
    width: usize,
    height: usize,
}

fn pack_yuv420(dst: &mut [u8], y: Plane<'_>, u: Plane<'_>, v: Plane<'_>) {
    let y_size = y.width * y.height;
    let u_size = u.width * u.height;
    extract_plane(&mut dst[..y_size], y);
    extract_plane(&mut dst[y_size..y_size + u_size], u);
    extract_plane(&mut dst[y_size + u_size..], v);
}

/// Copy a plane from padded source rows into a contiguous destination.
#[inline]
fn extract_plane(dst: &mut [u8], plane: Plane<'_>) {
    let Plane {
        data: src,
        stride,
        width,
        height,
    } = plane;

    if stride == width && src.len() >= width * height && dst.len() >= width * height {
        dst[..width * height].copy_from_slice(&src[..width * height]);
        return;
    }

    for r in 0..height {
        let src_start = r * stride;
        let dst_start = r * width;
        if src_start + width > src.len() || dst_start + width > dst.len() {
            break;
        }
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}
