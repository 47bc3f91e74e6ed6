//! Store configuration.

use rand::Rng;

/// Tunables for a [`MergeIndex`](crate::MergeIndex) store.
#[derive(Clone, Debug)]
pub struct Config {
    /// Target size in bytes of the head buffer's log before it is sealed
    /// and handed to the converter. The effective threshold is re-drawn
    /// per buffer with ±25% jitter so that stores sharing a host do not
    /// roll over in lockstep.
    pub buffer_rollover_size: u64,
    /// Upper bound on the number of segments merged by one compaction.
    pub max_compact_segments: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            buffer_rollover_size: 1024 * 1024,
            max_compact_segments: 20,
        }
    }
}

impl Config {
    /// Set the buffer rollover size in bytes.
    pub fn buffer_rollover_size(mut self, bytes: u64) -> Config {
        self.buffer_rollover_size = bytes;
        self
    }

    /// Set the per-compaction segment cap.
    pub fn max_compact_segments(mut self, count: usize) -> Config {
        self.max_compact_segments = count;
        self
    }

    /// Draw the fuzzed rollover threshold for a fresh head buffer.
    pub(crate) fn fuzzed_rollover(&self) -> u64 {
        let jitter = rand::thread_rng().gen_range(-0.25f64..=0.25f64);
        (self.buffer_rollover_size as f64 * (1.0 + jitter)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzzed_rollover_stays_within_a_quarter() {
        let config = Config::default().buffer_rollover_size(1000);
        for _ in 0..100 {
            let drawn = config.fuzzed_rollover();
            assert!((750..=1250).contains(&drawn), "drawn {}", drawn);
        }
    }
}
