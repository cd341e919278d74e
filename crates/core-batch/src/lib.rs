//! Manufactory Core Batch: pure-logic allocation primitives
//!
//! # Overview
//!
//! This crate holds the in-memory algorithms the execution core is built on:
//!
//! - **Loop**: round-robin container over opaque handles
//! - **BatchLedger**: cursor range, hold map, recycle pool and heap of one pipe
//! - **BatchGetter**: direct (ascending) and reverse (descending) allocation
//!   over a ledger, with recycle-first delivery and gap detection
//! - **Dead letters**: recycle entries that exhausted `max_attempts`
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Piece storage (databases, payloads)
//! - Async runtimes or threads
//! - Building logic
//!
//! # Architecture
//!
//! ```text
//!        Pipe (owns the ledger)
//!             │
//!             ▼
//! ┌─────────────────────────────────────────┐
//! │       BatchGetter                       │  ← Direct / Reverse
//! │  (recycle pool first, then the heap)    │
//! └─────────────┬───────────────────────────┘
//!               │ &mut BatchLedger
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       BatchLedger                       │
//! │  cursors │ hold │ recycle │ heap        │
//! └─────────────┬───────────────────────────┘
//!               │ attempts >= max_attempts
//!               ▼
//!          Dead letters
//! ```
//!
//! # Usage Example
//!
//! ```
//! use manufactory_core_batch::prelude::*;
//!
//! let mut ledger = BatchLedger::new(3);
//! ledger.extend_heap(0..10);
//!
//! let getter = PipeOrdering::Direct.getter();
//! let draw = getter.get_batch(&mut ledger, 4);
//! assert_eq!(draw.ids, vec![0, 1, 2, 3]);
//!
//! // 1 failed, the rest succeeded
//! getter.recycle(&mut ledger, &[1], false);
//! getter.release(&mut ledger, &[0, 2, 3]);
//!
//! let draw = getter.get_batch(&mut ledger, 2);
//! assert_eq!(draw.ids, vec![1, 4]);
//! ```

pub mod getter;
pub mod ledger;
pub mod round_robin;

pub use getter::{BatchGetter, DirectGetter, Draw, PipeOrdering, ReverseGetter};
pub use ledger::{
    AttemptEntry, BatchLedger, CursorSnapshot, DeadLetter, GapReport, PieceId, RecycleOutcome,
    DEFAULT_MAX_ATTEMPTS, MAX_GAP_SPAN,
};
pub use round_robin::Loop;

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::getter::{BatchGetter, DirectGetter, Draw, PipeOrdering, ReverseGetter};
    pub use super::ledger::{BatchLedger, CursorSnapshot, DeadLetter, PieceId};
    pub use super::round_robin::Loop;
}
