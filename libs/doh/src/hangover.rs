use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Cool-down after a misbehaving reply, rate-limiting queries to servers
/// that are misconfigured or hostile.
const HANGOVER_DURATION: Duration = Duration::from_secs(10);

/// A monotonic deadline before which the server is not contacted.
///
/// The query fast path only ever takes the read lock.
pub(crate) struct Hangover {
    until: RwLock<Option<Instant>>,
}

impl Hangover {
    pub(crate) fn new() -> Self {
        Self {
            until: RwLock::new(None),
        }
    }

    /// Time left in the current hangover, if one is active.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        let until = (*self.until.read())?;

        until.checked_duration_since(Instant::now())
    }

    pub(crate) fn open(&self) {
        *self.until.write() = Some(Instant::now() + HANGOVER_DURATION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_without_hangover() {
        assert_eq!(Hangover::new().remaining(), None);
    }

    #[test]
    fn open_sets_a_deadline() {
        let hangover = Hangover::new();

        hangover.open();

        let remaining = hangover.remaining().unwrap();
        assert!(remaining <= HANGOVER_DURATION);
        assert!(remaining > HANGOVER_DURATION - Duration::from_secs(1));
    }
}
