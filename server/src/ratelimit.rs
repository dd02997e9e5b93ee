//! Token-bucket rate limiter, one per [`crate::rules::RuleState`].
//!
//! A single shared bucket per rule, not per connection: fairness between
//! connections of the same rule is explicitly not a goal, only an
//! aggregate throughput cap. `rate == 0` disables limiting entirely (the
//! bucket is never constructed in that case, so `wait` is a no-op with no
//! locking cost).

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
    }
}

pub struct RateLimiter {
    bucket: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    /// `rate_bps` of 0 disables the limiter. The bucket's burst capacity
    /// is one second's worth of traffic at `rate_bps`.
    pub fn new(rate_bps: u64) -> Self {
        if rate_bps == 0 {
            return Self { bucket: None };
        }
        let rate = rate_bps as f64;
        Self {
            bucket: Some(Mutex::new(Bucket {
                tokens: rate,
                capacity: rate,
                rate,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Deducts `n` bytes worth of tokens, sleeping first if the bucket is
    /// short. Safe to call concurrently from multiple connections of the
    /// same rule.
    pub async fn wait(&self, n: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let mut need = n as f64;
        loop {
            let sleep_for = {
                let mut b = bucket.lock().await;
                b.refill(Instant::now());
                if need <= b.tokens {
                    b.tokens -= need;
                    None
                } else {
                    let deficit = need - b.tokens;
                    b.tokens = 0.0;
                    need = 0.0;
                    Some(Duration::from_secs_f64(deficit / b.rate))
                }
            };
            match sleep_for {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}
