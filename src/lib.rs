pub mod classify;
pub mod clock;
pub mod ipc;
pub mod schedule;
pub mod store;
pub mod sync;
