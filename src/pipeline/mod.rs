//! Stages of the asset upload pipeline.
//!
//! Each submodule implements exactly one step. Keeping stages separate makes
//! each independently testable and lets hosts swap the network layer or the
//! codec without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! manifest entry ──▶ download ──▶ normalize ──▶ dispatch ──▶ new URL
//!                   (transport)   (codec)      (strategy)
//! ```
//!
//! 1. [`download`]  — fetch the bytes, or decode a `local://` payload; falls
//!    back to the entry's proxy URL when the direct fetch fails
//! 2. [`normalize`] — re-encode, compress and resize to the destination's
//!    constraints; runs in `spawn_blocking` because codec work is CPU-bound
//! 3. [`dispatch`]  — send the asset the way the strategy's mode says and
//!    parse the new URL out of the answer
//!
//! [`transport`] is the only module that performs network I/O and
//! [`codec`] the only one that touches pixels.

pub mod codec;
pub mod dispatch;
pub mod download;
pub mod normalize;
pub mod transport;
