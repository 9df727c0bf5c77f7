//! Per-job pipeline stages.
//!
//! Each submodule implements exactly one step, so each is independently
//! testable and the dispatcher only wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! lister ──▶ execute ◀── retry ──▶ postprocess
//! (keys)     (1 attempt) (policy)   (cleanup)
//! ```
//!
//! 1. [`lister`]: enumerate source keys once per fresh batch
//! 2. [`execute`]: read, convert, validate and write one document; the only
//!    stage with network and storage I/O
//! 3. [`retry`]: wrap `execute` with backoff, re-acquiring an endpoint per
//!    attempt
//! 4. [`postprocess`]: decode and tidy the converter's response body

pub mod execute;
pub mod lister;
pub mod postprocess;
pub mod retry;
