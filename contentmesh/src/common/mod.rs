//! Shared building blocks: field values, constants, named locks and the
//! mutation event bus.

mod constants;
mod event_bus;
mod lock;
mod value;

pub use constants::*;
pub use event_bus::*;
pub use lock::*;
pub use value::*;

use std::thread::available_parallelism;

/// Returns the number of available CPU cores, defaulting to 1.
pub fn get_cpu_count() -> usize {
    available_parallelism()
        .map(|p| p.get())
        .unwrap_or_else(|err| {
            log::warn!("Failed to detect available parallelism: {}. Defaulting to single thread.", err);
            1
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_cpu_count_positive() {
        assert!(get_cpu_count() > 0);
    }
}
