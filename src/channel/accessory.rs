//! USB accessory channel.
//!
//! The accessory is exposed by the platform as a device node (or an inherited
//! file descriptor reachable through `/proc/self/fd/N`). Reads and writes go
//! through two handles of the same open file.

use anyhow::{Context, Result};
use log::info;
use std::fs::OpenOptions;
use std::path::Path;
use tokio::fs::File;

use super::{ChannelKind, StreamChannel};

pub type AccessoryChannel = StreamChannel<File, File>;

/// Open the accessory at `path` for reading and writing.
pub fn open_accessory(path: &Path) -> Result<AccessoryChannel> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open accessory {}", path.display()))?;
    let writer = file
        .try_clone()
        .with_context(|| format!("Failed to duplicate accessory handle {}", path.display()))?;
    info!("Accessory {} opened", path.display());

    Ok(StreamChannel::new(
        ChannelKind::Accessory,
        path.display().to_string(),
        File::from_std(file),
        File::from_std(writer),
    ))
}
