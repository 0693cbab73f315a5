//! Periodically refreshed signing credentials.
//!
//! Long archive runs outlive any single set of instance credentials, so the provider re-resolves
//! the default chain (environment, profile, instance metadata service) once the configured
//! refresh interval has elapsed.  Requests already in flight keep the identity they were signed
//! with; only new dispatches pick up the refreshed one.

use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_credential_types::provider::{self, future, ProvideCredentials};
use aws_credential_types::Credentials;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug)]
pub struct RefreshingCredentials {
    inner: DefaultCredentialsChain,
    interval: Duration,
    cached: Mutex<Option<(Credentials, Instant)>>,
}

impl RefreshingCredentials {
    pub async fn new(interval: Duration) -> Self {
        Self {
            inner: DefaultCredentialsChain::builder().build().await,
            interval,
            cached: Mutex::new(None),
        }
    }

    async fn resolve(&self) -> provider::Result {
        let mut cached = self.cached.lock().await;

        if let Some((credentials, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < self.interval {
                return Ok(credentials.clone());
            }
            debug!(
                elapsed = ?fetched_at.elapsed(),
                "credential refresh interval elapsed, re-resolving"
            );
        }

        let credentials = self.inner.provide_credentials().await?;
        info!("materialized fresh signing credentials");
        *cached = Some((credentials.clone(), Instant::now()));

        Ok(credentials)
    }
}

impl ProvideCredentials for RefreshingCredentials {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::new(self.resolve())
    }
}
