use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Rate limiter that always keeps the newest value. A value arriving inside
/// the refractory window replaces whatever is waiting; [`LatestWins::release`]
/// hands the survivor out once the window closes.
pub struct LatestWins<T> {
    interval: Duration,
    last: Option<Instant>,
    pending: Option<T>,
}

impl<T> LatestWins<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            pending: None,
        }
    }

    /// Passes the value through when the window is open, otherwise stashes
    /// it (displacing any older stashed value) and returns `None`.
    pub fn admit(&mut self, value: T) -> Option<T> {
        let now = Instant::now();
        match self.last {
            Some(last) if now < last + self.interval => {
                self.pending = Some(value);
                None
            }
            _ => {
                self.last = Some(now);
                self.pending = None;
                Some(value)
            }
        }
    }

    /// Waits out the window and yields the stashed value. Resolves to `None`
    /// immediately when nothing is stashed, which parks the corresponding
    /// `select!` branch.
    pub async fn release(&mut self) -> Option<T> {
        self.pending.as_ref()?;
        if let Some(last) = self.last {
            sleep_until(last + self.interval).await;
        }
        self.last = Some(Instant::now());
        self.pending.take()
    }
}

/// `select!` helper for an optional throttle; `None` means unthrottled and
/// the branch never fires.
pub async fn release_pending<T>(throttle: &mut Option<LatestWins<T>>) -> Option<T> {
    match throttle {
        Some(t) => t.release().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_value_passes() {
        let mut throttle = LatestWins::new(Duration::from_millis(100));
        assert_eq!(throttle.admit(1), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newest_value_survives_window() {
        let mut throttle = LatestWins::new(Duration::from_millis(100));
        assert_eq!(throttle.admit(1), Some(1));
        assert_eq!(throttle.admit(2), None);
        assert_eq!(throttle.admit(3), None);
        let released = throttle.release().await;
        assert_eq!(released, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_idle_returns_none() {
        let mut throttle: LatestWins<u32> = LatestWins::new(Duration::from_millis(100));
        assert_eq!(throttle.release().await, None);
        throttle.admit(1);
        assert_eq!(throttle.release().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reopens_after_interval() {
        let mut throttle = LatestWins::new(Duration::from_millis(100));
        assert_eq!(throttle.admit(1), Some(1));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(throttle.admit(2), Some(2));
    }
}
