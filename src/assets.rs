pub const FRAME_RATE: u32 = 30;
pub const FRAME_WIDTH: u32 = 1920;
pub const FRAME_HEIGHT: u32 = 1080;

/// Largest frame payload accepted on the wire, derived from the maximum resolution.
pub const MAX_FRAME_SIZE: usize = (FRAME_WIDTH * FRAME_HEIGHT) as usize;

// connections
pub const SERVER_PORT: u16 = 53516;
pub const DEFAULT_SERVER_IP: &str = "127.0.0.1";
pub const SOCKET_READ_SIZE: usize = 64 * 1024;
pub const ACCESSORY_READ_SIZE: usize = 16384;

// decoder
pub const INPUT_SLOT_CAPACITY: usize = 20;
pub const PACING_MULTIPLIER: u64 = 8;

// pointer uplink
pub const POINTER_EVENT_LEN: usize = 8;

// health
pub const HEALTH_LOG_INTERVAL_SECS: u64 = 30;

#[cfg(target_os = "windows")]
pub const TARGET_OS: &str = "windows";
#[cfg(target_os = "macos")]
pub const TARGET_OS: &str = "macos";
#[cfg(target_os = "linux")]
pub const TARGET_OS: &str = "linux";
#[cfg(target_os = "android")]
pub const TARGET_OS: &str = "android";
#[cfg(not(any(
    target_os = "windows",
    target_os = "macos",
    target_os = "linux",
    target_os = "android"
)))]
pub const TARGET_OS: &str = "unknown";
