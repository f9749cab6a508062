//! Render targets for decoded video

use anyhow::{Context, Result};
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::decoder::VideoFrame;

/// Surface decoded frames are presented on.
///
/// Owned by the decoder once configured; `present` is called for every output
/// buffer released with `render = true`.
pub trait RenderTarget: Send {
    fn present(&mut self, frame: &VideoFrame) -> Result<()>;

    fn describe(&self) -> String;
}

/// Discards frames, keeping only a count.
#[derive(Debug, Clone, Default)]
pub struct NullTarget {
    presented: Arc<AtomicU64>,
}

impl NullTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter of presented frames, readable after the target was moved
    /// into a decoder.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.presented.clone()
    }
}

impl RenderTarget for NullTarget {
    fn present(&mut self, _frame: &VideoFrame) -> Result<()> {
        self.presented.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn describe(&self) -> String {
        "null".to_string()
    }
}

/// Appends packed YUV420p frames to a raw video file.
///
/// The result plays with e.g. `ffplay -f rawvideo -pixel_format yuv420p -video_size WxH`.
pub struct YuvFileTarget {
    path: PathBuf,
    writer: BufWriter<File>,
    dims: Option<(u32, u32)>,
}

impl YuvFileTarget {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            dims: None,
        })
    }
}

impl RenderTarget for YuvFileTarget {
    fn present(&mut self, frame: &VideoFrame) -> Result<()> {
        if self.dims != Some((frame.width, frame.height)) {
            info!(
                "YuvFileTarget: writing {}x{} frames to {}",
                frame.width,
                frame.height,
                self.path.display()
            );
            self.dims = Some((frame.width, frame.height));
        }
        self.writer
            .write_all(&frame.data)
            .and_then(|_| self.writer.flush())
            .with_context(|| format!("Failed to write frame to {}", self.path.display()))
    }

    fn describe(&self) -> String {
        format!("yuv file {}", self.path.display())
    }
}
