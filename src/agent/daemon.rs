use anyhow::Result;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::agent::commands::{Command, CommandChannel};
use crate::agent::requests::RequestChannel;
use crate::bus::{EventKind, EventSink, LogSink, UserSnapshot};
use crate::config::{self, Config};
use crate::enforcer::{Enforcer, StateStore};
use crate::notify::{DesktopNotifier, Notifier};
use crate::platform::Platform;
use crate::tamper::TamperDetector;

/// The long-running enforcement agent
///
/// Owns the engine and drives it from a fixed tick: tamper check, per-user
/// enforcement, usage accrual, file-request intake and status publication.
/// Inbound commands arrive on an mpsc channel and are dispatched on the same
/// task, so every mutation of a user's state is serialized.
pub struct Agent {
    config: Config,
    config_path: PathBuf,
    config_hash: String,
    enforcer: Arc<Mutex<Enforcer>>,
    platform: Arc<dyn Platform>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn EventSink>,
    requests: RequestChannel,
    command_files: CommandChannel,
    tamper: TamperDetector,
    tamper_active: bool,
    last_check: Instant,
    last_logged_in: HashSet<String>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        config_path: PathBuf,
        enforcer: Enforcer,
        platform: Arc<dyn Platform>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
        requests: RequestChannel,
        command_files: CommandChannel,
    ) -> Self {
        let config_hash = std::fs::read_to_string(&config_path)
            .map(|content| compute_config_hash(&content))
            .unwrap_or_default();
        let tamper = TamperDetector::new(config.activity.tamper_threshold_secs);

        Self {
            config,
            config_path,
            config_hash,
            enforcer: Arc::new(Mutex::new(enforcer)),
            platform,
            notifier,
            sink,
            requests,
            command_files,
            tamper,
            tamper_active: false,
            last_check: Instant::now(),
            last_logged_in: HashSet::new(),
        }
    }

    /// Run until interrupted
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<()> {
        info!("Starting enforcement agent");
        info!("Hostname: {}", self.config.device.hostname);
        info!(
            "Controlling users: {:?}",
            self.config
                .users
                .iter()
                .map(|u| u.username.as_str())
                .collect::<Vec<_>>()
        );

        if !crate::platform::common::is_root() {
            warn!("Not running as root - enforcement may not work!");
        }

        if let Err(e) = self.requests.ensure_dir() {
            warn!("Failed to prepare request directory: {:#}", e);
        }
        if let Err(e) = self.command_files.ensure_dir() {
            warn!("Failed to prepare command directory: {:#}", e);
        }

        if self.config.activity.tamper_detection {
            self.sink.publish_tamper(false, "OK");
        }

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.activity.poll_interval));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.last_check = Instant::now();
        info!("Enforcement agent running");

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                Some(command) = commands.recv() => self.dispatch(command).await,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn tick(&mut self) {
        self.reload_config_if_changed();

        if self.config.activity.tamper_detection {
            self.check_tamper().await;
        }

        self.check_and_enforce().await;
        self.account_usage().await;
        self.process_file_requests().await;
        self.process_command_files().await;
    }

    /// Pick up config edits without a restart
    ///
    /// The file content is hashed every tick; an unchanged hash skips the
    /// parse. An invalid edit is logged and the previous config stays live.
    fn reload_config_if_changed(&mut self) {
        let Ok(content) = std::fs::read_to_string(&self.config_path) else {
            return;
        };

        let hash = compute_config_hash(&content);
        if hash == self.config_hash {
            return;
        }
        self.config_hash = hash;

        let parsed = serde_yaml::from_str::<Config>(&content)
            .map_err(anyhow::Error::from)
            .and_then(|config| {
                config::validate_config(&config)?;
                Ok(config)
            });

        match parsed {
            Ok(new_config) => {
                info!("Configuration changed, reloading");
                self.config = new_config;
            }
            Err(e) => warn!("Ignoring invalid configuration update: {:#}", e),
        }
    }

    /// Report backward clock jumps, once per occurrence
    async fn check_tamper(&mut self) {
        let (tampered, message) = self.tamper.check();

        if tampered && !self.tamper_active {
            warn!("Clock tamper detected: {}", message);
            self.sink
                .publish_event("system", EventKind::ClockTamper, json!({ "message": message }));
            self.sink.publish_tamper(true, &message);
            self.tamper_active = true;
        } else if !tampered && self.tamper_active {
            self.sink.publish_tamper(false, "OK");
            self.tamper_active = false;
        }
    }

    /// Per-user enforcement pass: login edges, auto-resume, policy check with
    /// forced logout, warning emission and the status snapshot
    async fn check_and_enforce(&mut self) {
        let logged_in = self.platform.logged_in_users();
        let mut enforcer = self.enforcer.lock().await;

        for user in &self.config.users {
            let username = &user.username;
            let is_logged_in = logged_in.contains(username);
            let was_logged_in = self.last_logged_in.contains(username);

            if is_logged_in && !was_logged_in {
                info!("User {} logged in", username);
                self.sink.publish_event(username, EventKind::Login, json!({}));
            } else if !is_logged_in && was_logged_in {
                info!("User {} logged out", username);
                self.sink.publish_event(username, EventKind::Logout, json!({}));
            }

            if enforcer.is_paused(username)
                && enforcer
                    .check_pause_auto_resume(username, self.config.activity.pause_auto_resume)
            {
                self.notifier.send_paused_notification(username, false);
                self.sink.publish_event(
                    username,
                    EventKind::PauseChanged,
                    json!({ "paused": false, "auto": true }),
                );
            }

            let (allowed, reason) = enforcer.check_user(user);

            if is_logged_in {
                if !allowed {
                    // Logged in but not permitted: last warning, then out
                    self.notifier.send_time_warning(username, 0);
                    self.sink
                        .publish_event(username, EventKind::TimeExhausted, json!({}));
                    enforcer.force_logout(username, &reason, self.platform.as_ref());
                } else if user.daily_minutes > 0 {
                    let due =
                        enforcer.get_warnings_to_send(username, user.daily_minutes, &user.warnings);
                    for threshold in due {
                        let remaining = enforcer.get_time_remaining(username, user.daily_minutes);
                        if self.notifier.send_time_warning(username, remaining) {
                            enforcer.mark_warning_sent(username, threshold);
                            self.sink.publish_event(
                                username,
                                EventKind::TimeWarning,
                                json!({ "minutes_remaining": remaining, "threshold": threshold }),
                            );
                            info!("Sent {}-minute warning to {}", threshold, username);
                        }
                    }
                }
            }

            let usage_minutes = enforcer.usage_minutes(username);
            let time_remaining = enforcer.get_time_remaining(username, user.daily_minutes);
            let status = enforcer.get_status(username, is_logged_in);
            let state = enforcer.user_state(username).clone();

            self.sink.publish_snapshot(&UserSnapshot {
                username: username.clone(),
                active: is_logged_in && allowed,
                usage_minutes,
                daily_limit: user.daily_minutes,
                blocked: state.blocked,
                block_reason: state.block_reason,
                time_remaining,
                status,
                paused: state.paused,
                bonus_minutes: state.bonus_minutes,
                is_idle: state.is_idle,
                pending_request: state.pending_request,
            });
        }

        self.last_logged_in = logged_in;
    }

    /// Accrue elapsed time for every active user
    ///
    /// `last_check` advances to now on every tick, so a remainder below one
    /// whole minute is discarded rather than carried into the next tick.
    /// With the default 10 s tick the loss is bounded to one tick period per
    /// accrual, which keeps accrued totals reconstructible from the tick log.
    async fn account_usage(&mut self) {
        let now = Instant::now();
        let elapsed_minutes = (now - self.last_check).as_secs() / 60;
        self.last_check = now;

        if elapsed_minutes == 0 {
            return;
        }
        let elapsed_minutes = elapsed_minutes as u32;

        let logged_in = self.platform.logged_in_users();
        let idle_threshold_secs = self.config.activity.idle_threshold_minutes as u64 * 60;
        let mut enforcer = self.enforcer.lock().await;

        for user in &self.config.users {
            let username = &user.username;

            if !logged_in.contains(username) || enforcer.is_paused(username) {
                continue;
            }

            if idle_threshold_secs > 0 {
                let idle_secs = self.platform.user_idle_seconds(username);
                let locked = self.platform.is_session_locked(username);

                if idle_secs >= idle_threshold_secs || locked {
                    enforcer.set_idle(username, true);
                    continue;
                }
                enforcer.set_idle(username, false);
            }

            enforcer.add_usage(username, elapsed_minutes);
        }
    }

    /// Consume the file-based request channel
    async fn process_file_requests(&mut self) {
        for request in self.requests.drain() {
            if self.config.get_user(&request.username).is_none() {
                warn!("Request from uncontrolled user: {}", request.username);
                continue;
            }

            let mut enforcer = self.enforcer.lock().await;
            if enforcer.has_pending_request(&request.username) {
                debug!(
                    "User {} already has a pending request, dropping new one",
                    request.username
                );
                continue;
            }

            let created =
                enforcer.create_time_request(&request.username, request.minutes, &request.reason);
            drop(enforcer);

            self.notifier.send_request_submitted(&request.username);
            self.sink.publish_event(
                &request.username,
                EventKind::TimeRequest,
                json!({
                    "request_id": created.id,
                    "minutes": created.minutes,
                    "reason": created.reason,
                }),
            );
            info!(
                "Processed file request from {}: {}m",
                request.username, request.minutes
            );
        }
    }

    /// Consume the file-based command channel
    async fn process_command_files(&mut self) {
        for command in self.command_files.drain() {
            self.dispatch(command).await;
        }
    }

    /// Dispatch one inbound command to the engine
    pub async fn dispatch(&mut self, command: Command) {
        debug!("Dispatching command: {:?}", command);

        match command {
            Command::Lock { user } => {
                for username in self.target_users(user) {
                    let mut enforcer = self.enforcer.lock().await;
                    enforcer.force_logout(&username, "Remote lock command", self.platform.as_ref());
                }
            }
            Command::Unlock { user } => {
                for username in self.target_users(user) {
                    self.enforcer.lock().await.unblock_user(&username);
                }
            }
            Command::Pause { user } => {
                for username in self.target_users(user) {
                    self.enforcer.lock().await.set_paused(&username, true);
                    self.notifier.send_paused_notification(&username, true);
                    self.sink.publish_event(
                        &username,
                        EventKind::PauseChanged,
                        json!({ "paused": true }),
                    );
                }
            }
            Command::Resume { user } => {
                for username in self.target_users(user) {
                    self.enforcer.lock().await.set_paused(&username, false);
                    self.notifier.send_paused_notification(&username, false);
                    self.sink.publish_event(
                        &username,
                        EventKind::PauseChanged,
                        json!({ "paused": false }),
                    );
                }
            }
            Command::AddTime { user, minutes } => {
                for username in self.target_users(user) {
                    self.enforcer.lock().await.add_bonus_time(&username, minutes);
                    self.notifier.send_bonus_time_notification(&username, minutes);
                    self.sink.publish_event(
                        &username,
                        EventKind::BonusTime,
                        json!({ "minutes": minutes }),
                    );
                }
            }
            Command::RequestTime {
                user,
                minutes,
                reason,
            } => {
                if self.config.get_user(&user).is_none() {
                    warn!("Time request for uncontrolled user: {}", user);
                    return;
                }

                let mut enforcer = self.enforcer.lock().await;
                if enforcer.has_pending_request(&user) {
                    debug!("User {} already has a pending request", user);
                    return;
                }

                let created = enforcer.create_time_request(&user, minutes, &reason);
                drop(enforcer);

                self.notifier.send_request_submitted(&user);
                self.sink.publish_event(
                    &user,
                    EventKind::TimeRequest,
                    json!({
                        "request_id": created.id,
                        "minutes": created.minutes,
                        "reason": created.reason,
                    }),
                );
            }
            Command::ApproveRequest { user } => {
                for username in self.target_users(user) {
                    let granted = self.enforcer.lock().await.approve_request(&username);
                    if let Some(minutes) = granted {
                        self.notifier.send_request_approved(&username, minutes);
                        self.sink.publish_event(
                            &username,
                            EventKind::RequestApproved,
                            json!({ "minutes": minutes }),
                        );
                    }
                }
            }
            Command::DenyRequest { user } => {
                for username in self.target_users(user) {
                    if self.enforcer.lock().await.deny_request(&username) {
                        self.notifier.send_request_denied(&username);
                        self.sink
                            .publish_event(&username, EventKind::RequestDenied, json!({}));
                    }
                }
            }
        }
    }

    /// Resolve a command's target to concrete controlled usernames
    fn target_users(&self, user: Option<String>) -> Vec<String> {
        match user {
            Some(name) => {
                if self.config.get_user(&name).is_some() {
                    vec![name]
                } else {
                    warn!("Command targets uncontrolled user: {}", name);
                    Vec::new()
                }
            }
            None => self
                .config
                .users
                .iter()
                .map(|u| u.username.clone())
                .collect(),
        }
    }
}

fn compute_config_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Wire up the agent with the system collaborators and run it
pub async fn run_agent(config: Config, config_path: PathBuf) -> Result<()> {
    let store = StateStore::new(StateStore::default_path());
    let enforcer = Enforcer::new(store, config.timezone_offset_minutes);
    let requests = RequestChannel::new(RequestChannel::default_dir());

    // The sender side is where a bus transport plugs in; without one the
    // agent still runs the full accounting loop.
    let (_command_tx, command_rx) = mpsc::channel::<Command>(16);

    let agent = Agent::new(
        config,
        config_path,
        enforcer,
        Arc::new(crate::platform::system_platform()),
        Arc::new(DesktopNotifier::new()),
        Arc::new(LogSink),
        requests,
        CommandChannel::new(CommandChannel::default_dir()),
    );

    agent.run(command_rx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::requests::FileRequest;
    use crate::config::{ActivityConfig, DeviceConfig, ScheduleConfig, UserConfig};
    use crate::enforcer::UserStatus;
    use serde_json::Value;
    use tempfile::TempDir;

    struct TestPlatform {
        logged_in: HashSet<String>,
        idle_secs: u64,
        locked: bool,
    }

    impl TestPlatform {
        fn with_user(username: &str) -> Self {
            Self {
                logged_in: HashSet::from([username.to_string()]),
                idle_secs: 0,
                locked: false,
            }
        }
    }

    impl Platform for TestPlatform {
        fn name(&self) -> &'static str {
            "test"
        }
        fn logged_in_users(&self) -> HashSet<String> {
            self.logged_in.clone()
        }
        fn user_idle_seconds(&self, _username: &str) -> u64 {
            self.idle_secs
        }
        fn is_session_locked(&self, _username: &str) -> bool {
            self.locked
        }
        fn terminate_session(&self, _username: &str) -> bool {
            true
        }
        fn show_warning(&self, _username: &str, _title: &str, _message: &str) {}
    }

    struct NullNotifier;

    impl Notifier for NullNotifier {
        fn send_time_warning(&self, _username: &str, _minutes_left: i64) -> bool {
            true
        }
        fn send_paused_notification(&self, _username: &str, _paused: bool) -> bool {
            true
        }
        fn send_bonus_time_notification(&self, _username: &str, _minutes: u32) -> bool {
            true
        }
        fn send_request_submitted(&self, _username: &str) -> bool {
            true
        }
        fn send_request_approved(&self, _username: &str, _minutes: u32) -> bool {
            true
        }
        fn send_request_denied(&self, _username: &str) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        events: std::sync::Mutex<Vec<(String, EventKind, Value)>>,
    }

    impl CollectingSink {
        fn kinds(&self) -> Vec<EventKind> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(_, kind, _)| *kind)
                .collect()
        }
    }

    impl EventSink for CollectingSink {
        fn publish_event(&self, username: &str, kind: EventKind, payload: Value) {
            self.events
                .lock()
                .unwrap()
                .push((username.to_string(), kind, payload));
        }
        fn publish_snapshot(&self, _snapshot: &UserSnapshot) {}
        fn publish_tamper(&self, _tampered: bool, _message: &str) {}
    }

    fn user_config(username: &str, daily_minutes: u32) -> UserConfig {
        UserConfig {
            username: username.to_string(),
            daily_minutes,
            schedule: ScheduleConfig {
                weekday: "00:00-23:59".to_string(),
                weekend: "00:00-23:59".to_string(),
            },
            warnings: vec![10, 5, 1],
        }
    }

    fn make_agent(
        users: Vec<UserConfig>,
        platform: TestPlatform,
    ) -> (Agent, Arc<CollectingSink>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let enforcer = Enforcer::new(store, None);
        let sink = Arc::new(CollectingSink::default());

        let config = Config {
            device: DeviceConfig::default(),
            activity: ActivityConfig {
                idle_threshold_minutes: 5,
                ..Default::default()
            },
            users,
            timezone_offset_minutes: None,
        };

        let agent = Agent::new(
            config,
            dir.path().join("config.yaml"),
            enforcer,
            Arc::new(platform),
            Arc::new(NullNotifier),
            sink.clone(),
            RequestChannel::new(dir.path().join("requests")),
            CommandChannel::new(dir.path().join("commands")),
        );

        (agent, sink, dir)
    }

    fn rewind_last_check(agent: &mut Agent, secs: u64) {
        agent.last_check = Instant::now()
            .checked_sub(Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn accrues_whole_elapsed_minutes() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 120)], TestPlatform::with_user("alice"));

        rewind_last_check(&mut agent, 130);
        agent.account_usage().await;

        assert_eq!(agent.enforcer.lock().await.usage_minutes("alice"), 2);
    }

    #[tokio::test]
    async fn subminute_remainders_are_discarded() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 120)], TestPlatform::with_user("alice"));

        // Two consecutive 30-second ticks never add up to a minute
        rewind_last_check(&mut agent, 30);
        agent.account_usage().await;
        rewind_last_check(&mut agent, 30);
        agent.account_usage().await;

        assert_eq!(agent.enforcer.lock().await.usage_minutes("alice"), 0);
    }

    #[tokio::test]
    async fn paused_user_does_not_accrue() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 120)], TestPlatform::with_user("alice"));

        agent.enforcer.lock().await.set_paused("alice", true);
        rewind_last_check(&mut agent, 120);
        agent.account_usage().await;

        assert_eq!(agent.enforcer.lock().await.usage_minutes("alice"), 0);
    }

    #[tokio::test]
    async fn logged_out_user_does_not_accrue() {
        let platform = TestPlatform {
            logged_in: HashSet::new(),
            idle_secs: 0,
            locked: false,
        };
        let (mut agent, _sink, _dir) = make_agent(vec![user_config("alice", 120)], platform);

        rewind_last_check(&mut agent, 120);
        agent.account_usage().await;

        assert_eq!(agent.enforcer.lock().await.usage_minutes("alice"), 0);
    }

    #[tokio::test]
    async fn idle_user_is_marked_and_skipped() {
        let platform = TestPlatform {
            idle_secs: 400, // over the 5 minute threshold
            ..TestPlatform::with_user("alice")
        };
        let (mut agent, _sink, _dir) = make_agent(vec![user_config("alice", 120)], platform);

        rewind_last_check(&mut agent, 120);
        agent.account_usage().await;

        let mut enforcer = agent.enforcer.lock().await;
        assert_eq!(enforcer.usage_minutes("alice"), 0);
        assert!(enforcer.is_idle("alice"));
    }

    #[tokio::test]
    async fn locked_session_is_treated_as_idle() {
        let platform = TestPlatform {
            locked: true,
            ..TestPlatform::with_user("alice")
        };
        let (mut agent, _sink, _dir) = make_agent(vec![user_config("alice", 120)], platform);

        rewind_last_check(&mut agent, 120);
        agent.account_usage().await;

        let mut enforcer = agent.enforcer.lock().await;
        assert_eq!(enforcer.usage_minutes("alice"), 0);
        assert!(enforcer.is_idle("alice"));
    }

    #[tokio::test]
    async fn active_user_clears_idle_flag() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 120)], TestPlatform::with_user("alice"));

        agent.enforcer.lock().await.set_idle("alice", true);
        rewind_last_check(&mut agent, 70);
        agent.account_usage().await;

        let mut enforcer = agent.enforcer.lock().await;
        assert!(!enforcer.is_idle("alice"));
        assert_eq!(enforcer.usage_minutes("alice"), 1);
    }

    #[tokio::test]
    async fn exhausted_user_is_forced_out() {
        let (mut agent, sink, _dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        agent.enforcer.lock().await.add_usage("alice", 60);
        agent.check_and_enforce().await;

        let mut enforcer = agent.enforcer.lock().await;
        let state = enforcer.user_state("alice");
        assert!(state.blocked);
        assert_eq!(state.block_reason, "Daily time limit reached");
        assert!(sink.kinds().contains(&EventKind::TimeExhausted));
    }

    #[tokio::test]
    async fn login_and_logout_edges_publish_events() {
        let (mut agent, sink, _dir) =
            make_agent(vec![user_config("alice", 0)], TestPlatform::with_user("alice"));

        agent.check_and_enforce().await;
        assert_eq!(sink.kinds(), vec![EventKind::Login]);

        agent.platform = Arc::new(TestPlatform {
            logged_in: HashSet::new(),
            idle_secs: 0,
            locked: false,
        });
        agent.check_and_enforce().await;
        assert_eq!(sink.kinds(), vec![EventKind::Login, EventKind::Logout]);
    }

    #[tokio::test]
    async fn due_warnings_are_sent_once() {
        let (mut agent, sink, _dir) =
            make_agent(vec![user_config("alice", 120)], TestPlatform::with_user("alice"));

        agent.enforcer.lock().await.add_usage("alice", 115);

        agent.check_and_enforce().await;
        let warnings = sink
            .kinds()
            .iter()
            .filter(|k| **k == EventKind::TimeWarning)
            .count();
        assert_eq!(warnings, 2); // the 10 and 5 minute thresholds

        agent.check_and_enforce().await;
        let warnings = sink
            .kinds()
            .iter()
            .filter(|k| **k == EventKind::TimeWarning)
            .count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn dispatch_add_time_grants_bonus() {
        let (mut agent, sink, _dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        agent
            .dispatch(Command::AddTime {
                user: Some("alice".to_string()),
                minutes: 20,
            })
            .await;

        assert_eq!(agent.enforcer.lock().await.bonus_minutes("alice"), 20);
        assert!(sink.kinds().contains(&EventKind::BonusTime));
    }

    #[tokio::test]
    async fn dispatch_lock_and_unlock() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 0)], TestPlatform::with_user("alice"));

        agent.dispatch(Command::Lock { user: None }).await;
        assert!(agent.enforcer.lock().await.user_state("alice").blocked);

        agent.dispatch(Command::Unlock { user: None }).await;
        assert!(!agent.enforcer.lock().await.user_state("alice").blocked);
    }

    #[tokio::test]
    async fn dispatch_pause_publishes_change() {
        let (mut agent, sink, _dir) =
            make_agent(vec![user_config("alice", 0)], TestPlatform::with_user("alice"));

        agent
            .dispatch(Command::Pause {
                user: Some("alice".to_string()),
            })
            .await;

        assert!(agent.enforcer.lock().await.is_paused("alice"));
        assert!(sink.kinds().contains(&EventKind::PauseChanged));
    }

    #[tokio::test]
    async fn dispatch_ignores_uncontrolled_user() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 0)], TestPlatform::with_user("alice"));

        agent
            .dispatch(Command::Lock {
                user: Some("mallory".to_string()),
            })
            .await;

        // mallory is not controlled, so no state was created for her
        assert!(!agent.enforcer.lock().await.has_pending_request("mallory"));
        assert!(!agent.enforcer.lock().await.user_state("alice").blocked);
    }

    #[tokio::test]
    async fn request_approval_flow_via_commands() {
        let (mut agent, sink, _dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        agent
            .dispatch(Command::RequestTime {
                user: "alice".to_string(),
                minutes: 30,
                reason: "homework".to_string(),
            })
            .await;
        assert!(agent.enforcer.lock().await.has_pending_request("alice"));

        agent
            .dispatch(Command::ApproveRequest {
                user: Some("alice".to_string()),
            })
            .await;

        let mut enforcer = agent.enforcer.lock().await;
        assert!(!enforcer.has_pending_request("alice"));
        assert_eq!(enforcer.bonus_minutes("alice"), 30);
        assert!(sink.kinds().contains(&EventKind::RequestApproved));
    }

    #[tokio::test]
    async fn duplicate_request_is_rejected_by_dispatch() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        agent
            .dispatch(Command::RequestTime {
                user: "alice".to_string(),
                minutes: 30,
                reason: String::new(),
            })
            .await;
        agent
            .dispatch(Command::RequestTime {
                user: "alice".to_string(),
                minutes: 90,
                reason: String::new(),
            })
            .await;

        let pending = agent.enforcer.lock().await.pending_request("alice").unwrap();
        assert_eq!(pending.minutes, 30);
    }

    #[tokio::test]
    async fn file_requests_are_consumed_once() {
        let (mut agent, sink, _dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        agent
            .requests
            .submit(&FileRequest {
                username: "alice".to_string(),
                minutes: 25,
                reason: "movie".to_string(),
            })
            .unwrap();

        agent.process_file_requests().await;
        assert!(agent.enforcer.lock().await.has_pending_request("alice"));
        assert!(sink.kinds().contains(&EventKind::TimeRequest));

        // Nothing left to process
        agent.process_file_requests().await;
        let request_events = sink
            .kinds()
            .iter()
            .filter(|k| **k == EventKind::TimeRequest)
            .count();
        assert_eq!(request_events, 1);
    }

    #[tokio::test]
    async fn file_request_from_uncontrolled_user_is_dropped() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        agent
            .requests
            .submit(&FileRequest {
                username: "mallory".to_string(),
                minutes: 999,
                reason: String::new(),
            })
            .unwrap();

        agent.process_file_requests().await;
        assert!(!agent.enforcer.lock().await.has_pending_request("mallory"));
    }

    #[tokio::test]
    async fn command_files_are_dispatched() {
        let (mut agent, _sink, dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        std::fs::create_dir_all(dir.path().join("commands")).unwrap();
        std::fs::write(
            dir.path().join("commands").join("cmd.json"),
            r#"{"action": "pause", "user": "alice"}"#,
        )
        .unwrap();

        agent.process_command_files().await;
        assert!(agent.enforcer.lock().await.is_paused("alice"));
    }

    #[tokio::test]
    async fn config_reload_picks_up_edits() {
        let (mut agent, _sink, dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        std::fs::write(
            dir.path().join("config.yaml"),
            "users:\n  - username: alice\n    daily_minutes: 90\n",
        )
        .unwrap();

        agent.reload_config_if_changed();
        assert_eq!(agent.config.users[0].daily_minutes, 90);
    }

    #[tokio::test]
    async fn invalid_config_edit_keeps_previous_config() {
        let (mut agent, _sink, dir) =
            make_agent(vec![user_config("alice", 60)], TestPlatform::with_user("alice"));

        std::fs::write(dir.path().join("config.yaml"), "users: []\n").unwrap();

        agent.reload_config_if_changed();
        assert_eq!(agent.config.users.len(), 1);
        assert_eq!(agent.config.users[0].daily_minutes, 60);
    }

    #[tokio::test]
    async fn snapshot_status_reflects_engine_state() {
        let (mut agent, _sink, _dir) =
            make_agent(vec![user_config("alice", 0)], TestPlatform::with_user("alice"));

        let mut enforcer = agent.enforcer.lock().await;
        assert_eq!(enforcer.get_status("alice", true), UserStatus::Playing);
        enforcer.set_paused("alice", true);
        assert_eq!(enforcer.get_status("alice", true), UserStatus::Paused);
        drop(enforcer);

        agent.check_and_enforce().await;
    }
}
