//! Retry policies for metadata refreshes, consumers and producers.
//!
//! All policies are `backon::ExponentialBuilder`s derived from the configured
//! retry count and base backoff, capped at [`MAX_RETRY_BACKOFF_SECS`].
//!
//! | Policy | Base delay | Retries | Use |
//! |--------|-----------|---------|-----|
//! | `metadata_policy` | `metadata.retry_backoff` | `metadata.retry_max` | metadata refresh, coordinator lookup |
//! | `consumer_policy` | `consumer.retry_backoff` | `consumer.retry_max` | partition consumer error backoff |
//! | `producer_policy` | `producer.retry.backoff` | `producer.retry.max` | re-sending failed produce batches |
//!
//! ```rust,no_run
//! use backon::Retryable;
//! use kafkaesque_client::{config::ClientConfig, error::Error, retry};
//!
//! async fn example(config: &ClientConfig) -> Result<(), Error> {
//!     (|| async { Ok::<_, Error>(()) })
//!         .retry(retry::metadata_policy(config))
//!         .when(Error::is_retriable)
//!         .await
//! }
//! ```

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::config::ClientConfig;
use crate::constants::MAX_RETRY_BACKOFF_SECS;

fn policy(base: Duration, retries: usize) -> ExponentialBuilder {
    let base = base.max(Duration::from_millis(1));
    ExponentialBuilder::default()
        .with_min_delay(base)
        .with_max_delay(Duration::from_secs(MAX_RETRY_BACKOFF_SECS).max(base))
        .with_max_times(retries)
        .with_jitter()
}

pub fn metadata_policy(config: &ClientConfig) -> ExponentialBuilder {
    policy(config.metadata.retry_backoff, config.metadata.retry_max)
}

pub fn consumer_policy(config: &ClientConfig) -> ExponentialBuilder {
    policy(config.consumer.retry_backoff, config.consumer.retry_max)
}

pub fn producer_policy(config: &ClientConfig) -> ExponentialBuilder {
    policy(config.producer.retry.backoff, config.producer.retry.max)
}

/// Iterator of delays for hand-written retry loops; `None` once exhausted.
pub fn delays(policy: ExponentialBuilder) -> impl Iterator<Item = Duration> {
    policy.build()
}
