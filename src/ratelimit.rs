use crate::keys::KeyLimits;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const RPM_WINDOW: Duration = Duration::from_secs(60);
const JANITOR_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub auto_ban_threshold: u32,
    pub auto_ban_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auto_ban_threshold: 50,
            auto_ban_duration: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug)]
pub enum AdmissionDenied {
    AutoBanned { remaining: Duration },
    Limited { reason: String },
}

#[derive(Default, Debug)]
struct Counters {
    /// Request timestamps inside the sliding RPM window, per credential.
    windows: HashMap<String, Vec<Instant>>,
    /// `key:date` and `key:tool:date` daily counters.
    daily: HashMap<String, u32>,
    concurrent: HashMap<String, u32>,
    errors: HashMap<String, u32>,
    banned_at: HashMap<String, Instant>,
}

/// Per-credential admission control. All five maps live under one mutex;
/// the critical section never does I/O, so contention stays bounded.
#[derive(Debug)]
pub struct RateLimiter {
    counters: Mutex<Counters>,
    config: Mutex<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            config: Mutex::new(config),
        }
    }

    pub fn set_config(&self, config: RateLimitConfig) {
        *self.config.lock().expect("config lock") = config;
    }

    fn config(&self) -> RateLimitConfig {
        *self.config.lock().expect("config lock")
    }

    /// Atomic check + accounting + concurrency-token acquisition.
    ///
    /// A rejection never mutates any counter. On admission every charged
    /// counter is committed together, and the returned guard releases the
    /// concurrency slot exactly once, explicitly or on drop, whichever
    /// comes first.
    pub fn enter(
        self: &Arc<Self>,
        key_id: &str,
        limits: &KeyLimits,
        tool: &str,
    ) -> Result<ReleaseGuard, AdmissionDenied> {
        let config = self.config();
        let mut counters = self.counters.lock().expect("rate limiter lock");
        let now = Instant::now();
        let today = Utc::now().format("%Y-%m-%d").to_string();

        if let Some(banned_at) = counters.banned_at.get(key_id).copied() {
            let elapsed = now.saturating_duration_since(banned_at);
            if elapsed < config.auto_ban_duration {
                return Err(AdmissionDenied::AutoBanned {
                    remaining: config.auto_ban_duration - elapsed,
                });
            }
            counters.banned_at.remove(key_id);
            counters.errors.remove(key_id);
        }

        if limits.rpm > 0 {
            let window = counters.windows.entry(key_id.to_string()).or_default();
            window.retain(|t| now.saturating_duration_since(*t) < RPM_WINDOW);
            let in_window = window.len() as u32;
            if in_window >= limits.rpm {
                return Err(AdmissionDenied::Limited {
                    reason: format!("RPM limit exceeded ({}/{})", in_window, limits.rpm),
                });
            }
        }

        let daily_key = format!("{key_id}:{today}");
        if limits.daily_quota > 0 {
            let count = counters.daily.get(&daily_key).copied().unwrap_or(0);
            if count >= limits.daily_quota {
                return Err(AdmissionDenied::Limited {
                    reason: format!("Daily quota exceeded ({}/{})", count, limits.daily_quota),
                });
            }
        }

        let mut tool_daily_key = None;
        if !tool.is_empty() && tool != "unknown" {
            if let Some(quota) = limits.tool_quotas.get(tool).copied().filter(|q| *q > 0) {
                let key = format!("{key_id}:{tool}:{today}");
                let count = counters.daily.get(&key).copied().unwrap_or(0);
                if count >= quota {
                    return Err(AdmissionDenied::Limited {
                        reason: format!("Tool quota exceeded for {tool} ({count}/{quota})"),
                    });
                }
                tool_daily_key = Some(key);
            }
        }

        if limits.concurrent > 0 {
            let current = counters.concurrent.get(key_id).copied().unwrap_or(0);
            if current >= limits.concurrent {
                return Err(AdmissionDenied::Limited {
                    reason: format!(
                        "Concurrent limit exceeded ({}/{})",
                        current, limits.concurrent
                    ),
                });
            }
        }

        // All checks passed: commit accounting in one shot.
        if limits.rpm > 0 {
            counters
                .windows
                .entry(key_id.to_string())
                .or_default()
                .push(now);
        }
        if limits.daily_quota > 0 {
            *counters.daily.entry(daily_key).or_insert(0) += 1;
        }
        if let Some(key) = tool_daily_key {
            *counters.daily.entry(key).or_insert(0) += 1;
        }
        let holds_slot = limits.concurrent > 0;
        if holds_slot {
            *counters.concurrent.entry(key_id.to_string()).or_insert(0) += 1;
        }

        Ok(ReleaseGuard {
            limiter: self.clone(),
            key_id: key_id.to_string(),
            armed: AtomicBool::new(holds_slot),
        })
    }

    /// Resets the consecutive-error count after a successful request.
    pub fn record_success(&self, key_id: &str) {
        let mut counters = self.counters.lock().expect("rate limiter lock");
        counters.errors.insert(key_id.to_string(), 0);
    }

    /// Counts a failed request; returns true when the credential just
    /// crossed the auto-ban threshold.
    pub fn record_error(&self, key_id: &str) -> bool {
        let threshold = self.config().auto_ban_threshold;
        let mut counters = self.counters.lock().expect("rate limiter lock");
        let count = counters.errors.entry(key_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            counters.banned_at.insert(key_id.to_string(), Instant::now());
            return true;
        }
        false
    }

    pub fn is_auto_banned(&self, key_id: &str) -> Option<Duration> {
        let duration = self.config().auto_ban_duration;
        let mut counters = self.counters.lock().expect("rate limiter lock");
        let banned_at = counters.banned_at.get(key_id).copied()?;
        let elapsed = banned_at.elapsed();
        if elapsed >= duration {
            counters.banned_at.remove(key_id);
            counters.errors.remove(key_id);
            return None;
        }
        Some(duration - elapsed)
    }

    fn release_concurrent(&self, key_id: &str) {
        let mut counters = self.counters.lock().expect("rate limiter lock");
        if let Some(count) = counters.concurrent.get_mut(key_id) {
            if *count > 0 {
                *count -= 1;
            }
        }
    }

    /// Prunes stale window entries, yesterday's daily counters and expired
    /// bans. Not required for correctness, only for memory.
    pub fn sweep(&self) {
        let config = self.config();
        let mut counters = self.counters.lock().expect("rate limiter lock");
        let now = Instant::now();
        counters.windows.retain(|_, window| {
            window.retain(|t| now.saturating_duration_since(*t) < RPM_WINDOW);
            !window.is_empty()
        });
        let today = Utc::now().format("%Y-%m-%d").to_string();
        counters.daily.retain(|key, _| key.ends_with(&today));
        let expired: Vec<String> = counters
            .banned_at
            .iter()
            .filter(|(_, banned_at)| banned_at.elapsed() >= config.auto_ban_duration)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            counters.banned_at.remove(&key);
            counters.errors.remove(&key);
        }
    }

    pub fn spawn_janitor(self: &Arc<Self>) {
        let limiter = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(JANITOR_INTERVAL).await;
                limiter.sweep();
            }
        });
    }

    #[cfg(test)]
    fn snapshot(&self, key_id: &str, tool: &str) -> (usize, u32, u32, u32) {
        let counters = self.counters.lock().expect("rate limiter lock");
        let today = Utc::now().format("%Y-%m-%d").to_string();
        (
            counters
                .windows
                .get(key_id)
                .map(|w| w.len())
                .unwrap_or(0),
            counters
                .daily
                .get(&format!("{key_id}:{today}"))
                .copied()
                .unwrap_or(0),
            counters
                .daily
                .get(&format!("{key_id}:{tool}:{today}"))
                .copied()
                .unwrap_or(0),
            counters.concurrent.get(key_id).copied().unwrap_or(0),
        )
    }
}

/// Paired decrement for an admitted request's concurrency slot. Safe to
/// release any number of times; dropping an unreleased guard releases it,
/// which also covers panics and client disconnects.
#[derive(Debug)]
pub struct ReleaseGuard {
    limiter: Arc<RateLimiter>,
    key_id: String,
    armed: AtomicBool,
}

impl ReleaseGuard {
    pub fn release(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.limiter.release_concurrent(&self.key_id);
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}
