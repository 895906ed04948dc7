//! Tripwire: BLAKE3 source hashing, change detection, compile event log.

pub mod eventlog;
pub mod hasher;
pub mod watch;
