//! Token-bucket rate limiting.
//!
//! A [`Limiter`] owns a refill task that deposits one token per `rate` tick
//! into a bounded channel of capacity `burst`. `wait` consumes a token,
//! blocking while the bucket is empty; `try_wait` never blocks. `stop` halts
//! the refill task deterministically, so shutdown never leaves a detached
//! ticker behind.

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

pub struct Limiter {
    tokens: Mutex<mpsc::Receiver<()>>,
    stop: watch::Sender<bool>,
}

impl Limiter {
    /// A limiter refilling one token per `rate`, holding at most `burst`
    /// tokens. With `prefill`, the bucket starts full, allowing an initial
    /// burst before any limiting applies.
    pub fn new(rate: Duration, burst: usize, prefill: bool) -> Self {
        let (token_tx, token_rx) = mpsc::channel(burst.max(1));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        if prefill {
            for _ in 0..burst {
                let _ = token_tx.try_send(());
            }
        }

        tokio::spawn(async move {
            // first refill lands one full period after start, like a ticker
            let mut tick = interval_at(Instant::now() + rate, rate);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return,
                    _ = tick.tick() => {
                        // full bucket: drop the token
                        let _ = token_tx.try_send(());
                    }
                }
            }
        });

        Self {
            tokens: Mutex::new(token_rx),
            stop: stop_tx,
        }
    }

    /// Take a token, waiting for the next refill if the bucket is empty.
    /// Returns immediately once the limiter has been stopped.
    pub async fn wait(&self) {
        let mut rx = self.tokens.lock().await;
        let _ = rx.recv().await;
    }

    /// Take a token without waiting. `false` means the bucket is empty (or
    /// another task currently holds the bucket).
    pub fn try_wait(&self) -> bool {
        match self.tokens.try_lock() {
            Ok(mut rx) => rx.try_recv().is_ok(),
            Err(_) => false,
        }
    }

    /// Halt the refill task. Tokens already in the bucket remain usable.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The per-peer request limiters.
pub struct PeerLimiter {
    /// Three queries per second, bursting to three.
    pub query: Limiter,
    /// One announce every ten minutes, bursting to three. The burst is
    /// there as people may make "mistakes" with titles or descriptions.
    pub announce: Limiter,
}

impl Default for PeerLimiter {
    fn default() -> Self {
        Self {
            query: Limiter::new(Duration::from_secs(1) / 3, 3, true),
            announce: Limiter::new(Duration::from_secs(60 * 10), 3, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, pause, timeout};

    #[tokio::test]
    async fn prefilled_burst_is_immediate() {
        let limiter = Limiter::new(Duration::from_secs(60), 3, true);

        for _ in 0..3 {
            timeout(Duration::from_millis(100), limiter.wait())
                .await
                .expect("prefilled token should be available immediately");
        }
    }

    #[tokio::test]
    async fn exhausted_bucket_blocks_for_at_least_one_period() {
        pause();
        let rate = Duration::from_secs(1);
        let limiter = Limiter::new(rate, 3, true);

        for _ in 0..3 {
            limiter.wait().await;
        }

        // bucket now empty: the fourth wait must not complete before a refill
        let mut fourth = Box::pin(limiter.wait());
        assert!(
            timeout(Duration::from_millis(999), &mut fourth).await.is_err(),
            "wait returned before the refill period elapsed"
        );

        advance(Duration::from_secs(1)).await;
        timeout(Duration::from_millis(10), &mut fourth)
            .await
            .expect("refilled token should unblock wait");
    }

    #[tokio::test]
    async fn refill_never_exceeds_burst() {
        pause();
        let limiter = Limiter::new(Duration::from_millis(10), 2, false);

        // far more ticks than the burst size
        advance(Duration::from_secs(1)).await;

        assert!(limiter.try_wait());
        assert!(limiter.try_wait());
        assert!(!limiter.try_wait(), "bucket held more than burst tokens");
    }

    #[tokio::test]
    async fn try_wait_does_not_block() {
        let limiter = Limiter::new(Duration::from_secs(60), 1, false);
        assert!(!limiter.try_wait());
    }

    #[tokio::test]
    async fn stop_halts_refilling() {
        pause();
        let limiter = Limiter::new(Duration::from_millis(10), 1, false);
        limiter.stop();

        advance(Duration::from_secs(1)).await;
        assert!(!limiter.try_wait(), "token refilled after stop");
    }

    #[tokio::test]
    async fn peer_limiter_defaults_allow_initial_bursts() {
        let pl = PeerLimiter::default();
        assert!(pl.query.try_wait());
        assert!(pl.announce.try_wait());
    }
}
