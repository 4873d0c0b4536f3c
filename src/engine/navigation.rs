//! Navigation settlement.
//!
//! A navigation is "settled" by whichever of these fires first:
//!   1. `LoadFinished` -> [`Settlement::Loaded`]
//!   2. `LoadFailed` -> [`Settlement::Failed`]
//!   3. `Navigated` starts (or restarts) the redirect grace timer; if it fires
//!      with no further signal -> [`Settlement::RedirectSettled`]
//!   4. the hard timeout, which redirects never extend -> [`Settlement::TimedOut`]
//!
//! [`NavigationWait::settle`] consumes the wait, so the event receiver and both
//! timers are dropped on the first settlement. Settlement is never an error.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use ts_rs::TS;

use crate::config::NavigationConfig;
use crate::engine::driver::PageEvent;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Settlement {
    Loaded { url: String },
    Failed { url: String, error: String },
    RedirectSettled { url: String },
    TimedOut { url: String, after_ms: u64 },
}

impl Settlement {
    /// The URL the page is believed to be on (or was last attempted).
    pub fn url(&self) -> &str {
        match self {
            Settlement::Loaded { url }
            | Settlement::Failed { url, .. }
            | Settlement::RedirectSettled { url }
            | Settlement::TimedOut { url, .. } => url,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Settlement::Loaded { .. } | Settlement::RedirectSettled { .. })
    }

    /// Failure description recorded on the context, if any.
    pub fn error(&self) -> Option<String> {
        match self {
            Settlement::Failed { error, .. } => Some(error.clone()),
            Settlement::TimedOut { after_ms, .. } => {
                Some(AppError::NavigationTimeout(*after_ms).to_string())
            }
            _ => None,
        }
    }
}

/// Per-navigation state. Created right before the driver is told to navigate.
#[derive(Debug)]
pub struct NavigationWait {
    context_id: String,
    target_url: String,
    started_at: Instant,
    resolved: bool,
    last_url: Option<String>,
    grace_deadline: Option<Instant>,
    grace: Duration,
    hard_timeout: Duration,
}

impl NavigationWait {
    pub fn new(context_id: &str, target_url: &str, config: &NavigationConfig) -> Self {
        Self {
            context_id: context_id.to_string(),
            target_url: target_url.to_string(),
            started_at: Instant::now(),
            resolved: false,
            last_url: None,
            grace_deadline: None,
            grace: config.redirect_grace(),
            hard_timeout: config.hard_timeout(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn last_url(&self) -> Option<&str> {
        self.last_url.as_deref()
    }

    /// Feed one driver event. Returns the settlement on the transition to
    /// `Settled`, `None` while still waiting and for every event after.
    pub fn on_event(&mut self, event: PageEvent) -> Option<Settlement> {
        if self.resolved {
            return None;
        }
        match event {
            PageEvent::LoadFinished { url } => self.resolve(Settlement::Loaded { url }),
            PageEvent::LoadFailed { url, error } => self.resolve(Settlement::Failed { url, error }),
            PageEvent::Navigated { url } => {
                tracing::trace!(context_id = %self.context_id, url = %url, "Redirect observed, grace timer restarted");
                self.last_url = Some(url);
                self.grace_deadline = Some(Instant::now() + self.grace);
                None
            }
        }
    }

    fn on_grace_elapsed(&mut self) -> Option<Settlement> {
        let url = self.current_url();
        self.resolve(Settlement::RedirectSettled { url })
    }

    fn on_hard_timeout(&mut self) -> Option<Settlement> {
        let url = self.current_url();
        let after_ms = self.hard_timeout.as_millis() as u64;
        self.resolve(Settlement::TimedOut { url, after_ms })
    }

    fn on_closed(&mut self) -> Option<Settlement> {
        let url = self.current_url();
        self.resolve(Settlement::Failed {
            url,
            error: "driver closed".into(),
        })
    }

    /// Settle immediately as failed, e.g. when the driver rejected the
    /// navigate call itself.
    pub fn abort(mut self, error: String) -> Settlement {
        let url = self.current_url();
        self.resolved = true;
        Settlement::Failed { url, error }
    }

    /// Instant after which the navigation counts as timed out.
    pub fn hard_deadline(&self) -> Instant {
        self.started_at + self.hard_timeout
    }

    /// Settle as timed out without waiting, e.g. when the driver's navigate
    /// call itself outlived the hard deadline.
    pub fn expire(mut self) -> Settlement {
        let url = self.current_url();
        self.resolved = true;
        Settlement::TimedOut {
            url,
            after_ms: self.hard_timeout.as_millis() as u64,
        }
    }

    fn current_url(&self) -> String {
        self.last_url.clone().unwrap_or_else(|| self.target_url.clone())
    }

    fn resolve(&mut self, settlement: Settlement) -> Option<Settlement> {
        self.resolved = true;
        self.grace_deadline = None;
        Some(settlement)
    }

    /// Race the event stream against the grace and hard-timeout timers.
    pub async fn settle(mut self, mut events: broadcast::Receiver<PageEvent>) -> Settlement {
        let hard_deadline = self.hard_deadline();
        loop {
            let grace_deadline = self.grace_deadline;
            let outcome = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(hard_deadline) => self.on_hard_timeout(),
                _ = sleep_until_opt(grace_deadline) => self.on_grace_elapsed(),
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(context_id = %self.context_id, skipped, "Navigation event receiver lagged");
                        None
                    }
                    Err(RecvError::Closed) => self.on_closed(),
                },
            };

            if let Some(settlement) = outcome {
                tracing::debug!(
                    context_id = %self.context_id,
                    elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                    ?settlement,
                    "Navigation settled"
                );
                return settlement;
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NavigationConfig {
        NavigationConfig {
            redirect_grace_ms: 1_500,
            hard_timeout_ms: 15_000,
        }
    }

    fn navigated(url: &str) -> PageEvent {
        PageEvent::Navigated { url: url.into() }
    }

    #[test]
    fn test_redirects_then_load_settles_once() {
        let mut wait = NavigationWait::new("ctx", "https://a.example/", &config());
        assert!(wait.on_event(navigated("https://b.example/")).is_none());
        assert!(wait.on_event(navigated("https://c.example/")).is_none());
        assert!(wait.on_event(navigated("https://d.example/")).is_none());

        let settled = wait.on_event(PageEvent::LoadFinished {
            url: "https://d.example/".into(),
        });
        assert_eq!(
            settled,
            Some(Settlement::Loaded {
                url: "https://d.example/".into()
            })
        );

        assert!(wait.is_resolved());
        assert!(wait
            .on_event(PageEvent::LoadFailed {
                url: "x".into(),
                error: "late".into()
            })
            .is_none());
        assert!(wait.on_event(navigated("https://e.example/")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_finished_wins() {
        let (tx, rx) = broadcast::channel(16);
        let wait = NavigationWait::new("ctx", "https://a.example/", &config());
        tx.send(PageEvent::LoadFinished {
            url: "https://a.example/".into(),
        })
        .unwrap();
        let settlement = wait.settle(rx).await;
        assert!(settlement.is_success());
        assert!(matches!(settlement, Settlement::Loaded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_a_settlement() {
        let (tx, rx) = broadcast::channel(16);
        let wait = NavigationWait::new("ctx", "https://a.example/", &config());
        tx.send(PageEvent::LoadFailed {
            url: "https://a.example/".into(),
            error: "ERR_CONNECTION_RESET".into(),
        })
        .unwrap();
        let settlement = wait.settle(rx).await;
        assert_eq!(settlement.error().as_deref(), Some("ERR_CONNECTION_RESET"));
        assert_eq!(settlement.url(), "https://a.example/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_grace_settles_on_last_url() {
        let (tx, rx) = broadcast::channel(16);
        let wait = NavigationWait::new("ctx", "https://a.example/", &config());
        tx.send(navigated("https://login.example/")).unwrap();

        let started = Instant::now();
        let settlement = wait.settle(rx).await;
        assert_eq!(
            settlement,
            Settlement::RedirectSettled {
                url: "https://login.example/".into()
            }
        );
        assert!(started.elapsed() >= Duration::from_millis(1_500));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_redirects_hit_hard_timeout() {
        let (tx, rx) = broadcast::channel(16);
        let wait = NavigationWait::new("ctx", "https://a.example/", &config());

        let feeder = tokio::spawn(async move {
            for i in 0..100 {
                if tx.send(navigated(&format!("https://hop{i}.example/"))).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });

        let settlement = wait.settle(rx).await;
        match &settlement {
            Settlement::TimedOut { after_ms, .. } => assert_eq!(*after_ms, 15_000),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(settlement.error().unwrap().contains("15000"));
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_fails() {
        let (tx, rx) = broadcast::channel::<PageEvent>(16);
        let wait = NavigationWait::new("ctx", "https://a.example/", &config());
        drop(tx);
        let settlement = wait.settle(rx).await;
        assert_eq!(settlement.error().as_deref(), Some("driver closed"));
    }

    #[test]
    fn test_abort_uses_target_url() {
        let wait = NavigationWait::new("ctx", "https://a.example/", &config());
        let settlement = wait.abort("rejected".into());
        assert_eq!(settlement.url(), "https://a.example/");
        assert!(!settlement.is_success());
    }

    #[test]
    fn test_expire_reports_hard_timeout() {
        let wait = NavigationWait::new("ctx", "https://a.example/", &config());
        assert_eq!(wait.hard_deadline() - wait.started_at, Duration::from_millis(15_000));
        let settlement = wait.expire();
        assert_eq!(
            settlement,
            Settlement::TimedOut {
                url: "https://a.example/".into(),
                after_ms: 15_000,
            }
        );
        assert!(settlement.error().is_some());
    }
}
