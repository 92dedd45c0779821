use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::enforcer::{TimeRequest, UserStatus};

/// Event kinds delivered to the outward notification/status collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Login,
    Logout,
    TimeWarning,
    TimeExhausted,
    PauseChanged,
    BonusTime,
    TimeRequest,
    RequestApproved,
    RequestDenied,
    ClockTamper,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Login => "login",
            EventKind::Logout => "logout",
            EventKind::TimeWarning => "time_warning",
            EventKind::TimeExhausted => "time_exhausted",
            EventKind::PauseChanged => "pause_changed",
            EventKind::BonusTime => "bonus_time",
            EventKind::TimeRequest => "time_request",
            EventKind::RequestApproved => "request_approved",
            EventKind::RequestDenied => "request_denied",
            EventKind::ClockTamper => "clock_tamper",
        }
    }
}

/// Per-user status snapshot published every tick
#[derive(Debug, Clone, Serialize)]
pub struct UserSnapshot {
    pub username: String,
    pub active: bool,
    pub usage_minutes: u32,
    pub daily_limit: u32,
    pub blocked: bool,
    pub block_reason: String,
    pub time_remaining: i64,
    pub status: UserStatus,
    pub paused: bool,
    pub bonus_minutes: u32,
    pub is_idle: bool,
    pub pending_request: Option<TimeRequest>,
}

/// Outward boundary towards the message bus / status transport
///
/// The transport itself (MQTT, D-Bus, whatever the deployment wires up) lives
/// outside this crate; the agent only pushes typed payloads through this
/// trait.
pub trait EventSink: Send + Sync {
    fn publish_event(&self, username: &str, kind: EventKind, payload: Value);

    fn publish_snapshot(&self, snapshot: &UserSnapshot);

    fn publish_tamper(&self, tampered: bool, message: &str);
}

/// Default sink that writes everything to the log
///
/// Used when no bus transport is attached; keeps the event stream visible in
/// journald either way.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish_event(&self, username: &str, kind: EventKind, payload: Value) {
        info!("event {} user={} payload={}", kind.as_str(), username, payload);
    }

    fn publish_snapshot(&self, snapshot: &UserSnapshot) {
        debug!(
            "snapshot user={} status={} usage={} remaining={}",
            snapshot.username, snapshot.status, snapshot.usage_minutes, snapshot.time_remaining
        );
    }

    fn publish_tamper(&self, tampered: bool, message: &str) {
        info!("tamper state: {} ({})", tampered, message);
    }
}
