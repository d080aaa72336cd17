//! Background reconciliation of the action queue with the remote service.
//!
//! Every tick the engine persists the local state and, unless latched,
//! sends up to a fixed number of queued actions one at a time:
//!
//! | response            | action                    | counts as error |
//! |---------------------|---------------------------|-----------------|
//! | 2xx                 | removed                   | no              |
//! | 5xx / other         | requeued at the tail      | no              |
//! | 4xx                 | dropped, `SYNC_FAILED`    | yes             |
//! | transport failure   | requeued at the tail      | yes             |
//!
//! More than `max_errors_before_latch` errors in one pass latch the engine.
//! A latched engine sends nothing until its cooldown elapses, after which a
//! single probe decides whether to resume or stay latched. The latch is
//! stored under `<prefix>.sync`, so it survives a restart.
//!
//! Dequeued actions stay visible as in flight until their outcome is known:
//! they count as pending and are written at the head of the stored queue.

pub mod breaker;
pub mod engine;
pub(crate) mod task;

pub use breaker::{Breaker, EngineState, Gate, LatchRecord};
pub use engine::{SyncEngine, TickReport};
