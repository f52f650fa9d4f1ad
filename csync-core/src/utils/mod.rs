pub mod backoff;

pub use backoff::{Backoff, sleep_or_shutdown};
