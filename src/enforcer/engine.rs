use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::UserConfig;
use crate::enforcer::schedule;
use crate::enforcer::state::{StateStore, TimeRequest, UserState};
use crate::platform::Platform;

/// Where a user currently stands, for status displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UserStatus {
    Offline,
    Blocked,
    Paused,
    Playing,
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserStatus::Offline => "Offline",
            UserStatus::Blocked => "Blocked",
            UserStatus::Paused => "Paused",
            UserStatus::Playing => "Playing",
        };
        f.write_str(s)
    }
}

/// The enforcement engine
///
/// Owns every `UserState` and all policy decisions over them. Each mutating
/// operation writes the full state file back through the store; when a write
/// fails the in-memory state stays authoritative for the rest of the process
/// lifetime and the failure is logged.
pub struct Enforcer {
    users: BTreeMap<String, UserState>,
    store: StateStore,
    tz: Option<FixedOffset>,
}

impl Enforcer {
    /// Create an engine over the given store, loading any persisted state
    ///
    /// `timezone_offset_minutes` pins day boundaries and schedule windows to
    /// a fixed UTC offset; `None` uses the system local timezone.
    pub fn new(store: StateStore, timezone_offset_minutes: Option<i32>) -> Self {
        let users = store.load();
        if !users.is_empty() {
            info!("Loaded state for {} users", users.len());
        }

        let tz = timezone_offset_minutes.and_then(|minutes| {
            let offset = FixedOffset::east_opt(minutes * 60);
            if offset.is_none() {
                warn!("Ignoring invalid timezone offset: {} minutes", minutes);
            }
            offset
        });

        Self { users, store, tz }
    }

    fn now(&self) -> DateTime<FixedOffset> {
        match self.tz {
            Some(offset) => Utc::now().with_timezone(&offset),
            None => Local::now().fixed_offset(),
        }
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    /// Get or create state for a user
    pub fn user_state(&mut self, username: &str) -> &UserState {
        self.state_mut(username)
    }

    fn state_mut(&mut self, username: &str) -> &mut UserState {
        self.users.entry(username.to_string()).or_default()
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.users) {
            error!("Failed to save state: {:#}", e);
        }
    }

    /// Apply the day-boundary reset for a user if the stored date is stale
    fn roll_over(&mut self, username: &str) {
        let today = self.today();
        if self.state_mut(username).roll_over_if_stale(today) {
            debug!("Day rollover for {}", username);
            self.persist();
        }
    }

    /// Decide whether the user should currently be allowed
    ///
    /// Returns `(allowed, reason)`. Checks the applicable schedule window
    /// first, then the daily budget including bonus minutes.
    pub fn check_user(&mut self, user: &UserConfig) -> (bool, String) {
        self.roll_over(&user.username);

        let now = self.now();
        if !schedule::is_within_schedule(&user.schedule, now) {
            return (false, "Outside allowed hours".to_string());
        }

        if user.daily_minutes > 0 {
            let state = self.state_mut(&user.username);
            let total_allowed = user.daily_minutes + state.bonus_minutes;
            if state.usage_minutes >= total_allowed {
                return (false, "Daily time limit reached".to_string());
            }
        }

        (true, String::new())
    }

    /// Accrue usage time for a user
    ///
    /// Does not consult pause or idle state; the accounting loop decides
    /// whether a tick counts before calling this.
    pub fn add_usage(&mut self, username: &str, minutes: u32) {
        self.roll_over(username);

        let state = self.state_mut(username);
        state.usage_minutes += minutes;
        let total = state.usage_minutes;
        self.persist();
        debug!("User {} usage: {} minutes", username, total);
    }

    /// Today's accrued minutes (0 if the stored date is stale)
    pub fn usage_minutes(&mut self, username: &str) -> u32 {
        let today = self.today();
        let state = self.state_mut(username);
        if state.last_usage_date == Some(today) {
            state.usage_minutes
        } else {
            0
        }
    }

    /// Remaining minutes for today, including bonus time
    ///
    /// Returns -1 when the limit is 0 (unlimited). A stale stored date means
    /// a fresh day, so the full limit is available even before the rollover
    /// has been written back.
    pub fn get_time_remaining(&mut self, username: &str, daily_limit: u32) -> i64 {
        if daily_limit == 0 {
            return -1;
        }

        let today = self.today();
        let state = self.state_mut(username);
        if state.last_usage_date != Some(today) {
            return daily_limit as i64;
        }

        let total_allowed = daily_limit as i64 + state.bonus_minutes as i64;
        (total_allowed - state.usage_minutes as i64).max(0)
    }

    /// Warning thresholds that are due and not yet delivered today
    ///
    /// Read-only and idempotent; the caller marks each threshold via
    /// `mark_warning_sent` once the notification actually went out.
    pub fn get_warnings_to_send(
        &mut self,
        username: &str,
        daily_limit: u32,
        thresholds: &[u32],
    ) -> Vec<u32> {
        if daily_limit == 0 {
            return Vec::new();
        }

        let remaining = self.get_time_remaining(username, daily_limit);
        let state = self.state_mut(username);

        thresholds
            .iter()
            .copied()
            .filter(|t| !state.warnings_sent.contains(t) && remaining <= *t as i64)
            .collect()
    }

    /// Record a warning threshold as delivered for today
    pub fn mark_warning_sent(&mut self, username: &str, threshold: u32) {
        self.state_mut(username).warnings_sent.insert(threshold);
        self.persist();
    }

    /// Pause or resume usage accrual; idempotent, persists only on change
    pub fn set_paused(&mut self, username: &str, paused: bool) {
        let state = self.state_mut(username);
        if paused && !state.paused {
            state.paused = true;
            state.paused_at = Some(Utc::now());
            info!("Paused timer for {}", username);
        } else if !paused && state.paused {
            state.paused = false;
            state.paused_at = None;
            info!("Resumed timer for {}", username);
        } else {
            return;
        }
        self.persist();
    }

    pub fn is_paused(&mut self, username: &str) -> bool {
        self.state_mut(username).paused
    }

    /// Auto-resume a pause that has exceeded its timeout
    ///
    /// Must be polled; returns true when a resume happened.
    pub fn check_pause_auto_resume(&mut self, username: &str, auto_resume_minutes: u32) -> bool {
        let state = self.state_mut(username);
        if !state.paused {
            return false;
        }
        let Some(paused_at) = state.paused_at else {
            return false;
        };

        let elapsed = Utc::now() - paused_at;
        if elapsed >= chrono::Duration::minutes(auto_resume_minutes as i64) {
            self.set_paused(username, false);
            info!(
                "Auto-resumed timer for {} after {} minutes",
                username, auto_resume_minutes
            );
            return true;
        }

        false
    }

    /// Grant extra budget for today
    ///
    /// Also lifts a block whose reason names the daily limit; a manual lock
    /// stays in place.
    pub fn add_bonus_time(&mut self, username: &str, minutes: u32) {
        let state = self.state_mut(username);
        state.bonus_minutes += minutes;

        if state.blocked && state.block_reason.to_lowercase().contains("limit") {
            state.blocked = false;
            state.block_reason.clear();
        }

        let total = state.bonus_minutes;
        self.persist();
        info!(
            "Added {} bonus minutes for {} (total bonus: {})",
            minutes, username, total
        );
    }

    pub fn bonus_minutes(&mut self, username: &str) -> u32 {
        self.state_mut(username).bonus_minutes
    }

    /// Block the user and terminate their sessions
    ///
    /// The block is set and persisted before the termination attempt, so a
    /// failed termination still leaves future logins denied. Returns whether
    /// the live sessions were actually terminated.
    pub fn force_logout(&mut self, username: &str, reason: &str, platform: &dyn Platform) -> bool {
        warn!("Force logout {}: {}", username, reason);

        let state = self.state_mut(username);
        state.blocked = true;
        state.block_reason = reason.to_string();
        self.persist();

        platform.terminate_session(username)
    }

    /// Allow the user to log in again
    pub fn unblock_user(&mut self, username: &str) {
        let state = self.state_mut(username);
        state.blocked = false;
        state.block_reason.clear();
        self.persist();
        info!("Unblocked user {}", username);
    }

    /// Record the latest idle/lock observation (runtime only, not persisted)
    pub fn set_idle(&mut self, username: &str, idle: bool) {
        self.state_mut(username).is_idle = idle;
    }

    pub fn is_idle(&mut self, username: &str) -> bool {
        self.state_mut(username).is_idle
    }

    /// Create a pending time request, replacing any existing one
    pub fn create_time_request(&mut self, username: &str, minutes: u32, reason: &str) -> TimeRequest {
        let request = TimeRequest {
            id: Uuid::new_v4().to_string()[..8].to_string(),
            minutes,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };

        self.state_mut(username).pending_request = Some(request.clone());
        self.persist();
        info!("Created time request for {}: {} minutes", username, minutes);
        request
    }

    pub fn has_pending_request(&mut self, username: &str) -> bool {
        self.state_mut(username).pending_request.is_some()
    }

    pub fn pending_request(&mut self, username: &str) -> Option<TimeRequest> {
        self.state_mut(username).pending_request.clone()
    }

    /// Approve the pending request, granting its minutes as bonus time
    ///
    /// Returns the granted minutes, or None when nothing was pending.
    pub fn approve_request(&mut self, username: &str) -> Option<u32> {
        let request = self.state_mut(username).pending_request.take()?;
        self.add_bonus_time(username, request.minutes);
        info!(
            "Approved time request for {}: {} minutes",
            username, request.minutes
        );
        Some(request.minutes)
    }

    /// Deny and clear the pending request; returns whether one existed
    pub fn deny_request(&mut self, username: &str) -> bool {
        if self.state_mut(username).pending_request.take().is_none() {
            return false;
        }
        self.persist();
        info!("Denied time request for {}", username);
        true
    }

    /// Current status for displays; `logged_in` comes from the OS collaborator
    pub fn get_status(&mut self, username: &str, logged_in: bool) -> UserStatus {
        let state = self.state_mut(username);
        if !logged_in {
            UserStatus::Offline
        } else if state.blocked {
            UserStatus::Blocked
        } else if state.paused {
            UserStatus::Paused
        } else {
            UserStatus::Playing
        }
    }
}
