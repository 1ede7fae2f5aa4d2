//! Controller-wide constants.
//!
//! Timeouts are expressed in milliseconds as signed integers so the
//! `NO_TIMEOUT` sentinel can travel through the same parameter.

/// Sentinel for an unbounded wait.
///
/// # Examples
///
/// ```
/// use rfidctl_core::Wait;
/// use rfidctl_core::constants::NO_TIMEOUT;
///
/// assert_eq!(Wait::for_pipe(NO_TIMEOUT), Wait::Forever);
/// ```
pub const NO_TIMEOUT: i64 = -1;

/// Default open/close timeout for device sessions in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 3000;

/// Lower bound for the run-loop join performed by `close()`.
pub const MIN_JOIN_TIMEOUT_MS: u64 = 1;

/// Default number of traversed connections kept by a state machine.
///
/// A typical reader session walks fewer than ten states per connect cycle, so
/// 100 entries cover roughly ten full cycles for debugging.
pub const DEFAULT_MAX_HISTORY_SIZE: usize = 100;

/// Priority used by `EventQueue::put` when none is given.
pub const DEFAULT_PRIORITY: i32 = 0;
