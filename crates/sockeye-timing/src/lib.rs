mod clock;
mod duration;
mod limiter;
mod nanos;
mod repeater;
mod timer;

pub use clock::global_clock;
pub use duration::Duration;
pub use limiter::{LeakyBucket, RateLimiter, RateLimiterConfig};
pub use nanos::Nanos;
pub use repeater::Repeater;
pub use timer::{TimerHandle, TimerQueue};
