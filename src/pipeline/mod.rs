//! Decode-feed pipeline for wiredmon
//!
//! Turns a chunked byte stream into paced decoder input:
//! - Framing: [`reassembler`] recovers frame boundaries from arbitrary chunks
//! - Pacing: [`rate`] estimates throughput and assigns presentation timestamps
//! - Backpressure: [`arbiter`] hands free decoder input slots to the feed loop
//! - Control: [`session`] runs the state machine and owns cleanup
//! - Health monitoring tracks throughput, keyframes and decoder errors

pub mod arbiter;
pub mod health;
pub mod rate;
pub mod reassembler;
pub mod session;
pub mod state;
pub mod types;

pub use arbiter::{BufferArbiter, SlotNotifier};
pub use health::{HealthSummary, SessionHealth};
pub use rate::{Pacer, RateEstimator};
pub use reassembler::{Discipline, FrameReassembler, encode_frame};
pub use session::{DecodeFeedSession, SessionHandle, SessionReport};
pub use state::SessionState;
pub use types::{BufferSlot, Frame, Timestamp};
