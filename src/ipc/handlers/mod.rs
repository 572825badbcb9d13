pub mod core;
pub mod scan;
pub mod snapshot;
pub mod sync;
