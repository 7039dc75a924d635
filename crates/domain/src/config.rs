use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a turn's `final_message` is assembled from its agent messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// The last non-empty agent message (default).
    #[default]
    FinalOnly,
    /// All non-empty agent messages joined by a blank line.
    AllAgentMessages,
}

impl OutputPolicy {
    /// Lenient parse: unknown or empty values fall back to the default.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "all_agent_messages" => OutputPolicy::AllAgentMessages,
            _ => OutputPolicy::FinalOnly,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// App-server client config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tunables for a single app-server client: RPC and turn timeouts, stall
/// detection, oversize framing defenses, and restart pacing.
#[derive(Debug, Clone)]
pub struct AppServerConfig {
    /// Bounds any individual RPC. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Bounds a single turn. `None` waits indefinitely.
    pub turn_timeout: Option<Duration>,
    /// Idle period before a turn is considered stalled. `None` disables
    /// stall recovery.
    pub turn_stall_timeout: Option<Duration>,
    /// Poll cadence while waiting on a turn.
    pub turn_stall_poll_interval: Duration,
    /// Rate limit between `thread/resume` recovery probes.
    pub turn_stall_recovery_min_interval: Duration,

    /// Largest stdout line accepted before the drain protocol kicks in.
    pub max_message_bytes: usize,
    /// How much of an oversize line is kept for metadata sniffing.
    pub oversize_preview_bytes: usize,
    /// Absolute cap on bytes drained for one oversize line.
    pub max_oversize_drain_bytes: usize,

    /// Restart the subprocess automatically after a disconnect.
    pub auto_restart: bool,
    pub restart_backoff_initial: Duration,
    pub restart_backoff_max: Duration,
    /// Proportional jitter added to each backoff delay (0.10 = up to +10%).
    pub restart_backoff_jitter_ratio: f64,
    /// Bound on consecutive restart attempts before the client is marked
    /// permanently closed.
    pub max_restart_attempts: u32,

    pub output_policy: OutputPolicy,
}

impl Default for AppServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            turn_timeout: None,
            turn_stall_timeout: Some(Duration::from_secs(60)),
            turn_stall_poll_interval: Duration::from_secs(2),
            turn_stall_recovery_min_interval: Duration::from_secs(10),
            max_message_bytes: 50 * 1024 * 1024,
            oversize_preview_bytes: 4096,
            max_oversize_drain_bytes: 100 * 1024 * 1024,
            auto_restart: true,
            restart_backoff_initial: Duration::from_millis(500),
            restart_backoff_max: Duration::from_secs(30),
            restart_backoff_jitter_ratio: 0.1,
            max_restart_attempts: 10,
            output_policy: OutputPolicy::FinalOnly,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pool policies enforced by the workspace supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum concurrently-open clients; overflow evicts the
    /// least-recently-used idle client.
    pub max_clients: usize,
    /// Clients idle longer than this are closed by the periodic sweep.
    pub idle_ttl: Duration,
    /// Cadence of the idle sweep.
    pub sweep_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_clients: 20,
            idle_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_policy_parse_is_lenient() {
        assert_eq!(OutputPolicy::parse("final_only"), OutputPolicy::FinalOnly);
        assert_eq!(
            OutputPolicy::parse("ALL_AGENT_MESSAGES"),
            OutputPolicy::AllAgentMessages
        );
        assert_eq!(OutputPolicy::parse("bogus"), OutputPolicy::FinalOnly);
        assert_eq!(OutputPolicy::parse(""), OutputPolicy::FinalOnly);
    }

    #[test]
    fn app_server_defaults_match_contract() {
        let cfg = AppServerConfig::default();
        assert_eq!(cfg.max_message_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.max_oversize_drain_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.turn_stall_timeout, Some(Duration::from_secs(60)));
        assert_eq!(cfg.turn_stall_poll_interval, Duration::from_secs(2));
        assert_eq!(
            cfg.turn_stall_recovery_min_interval,
            Duration::from_secs(10)
        );
        assert_eq!(cfg.restart_backoff_initial, Duration::from_millis(500));
        assert_eq!(cfg.restart_backoff_max, Duration::from_secs(30));
        assert!(cfg.auto_restart);
    }

    #[test]
    fn supervisor_defaults() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.max_clients, 20);
        assert_eq!(cfg.idle_ttl, Duration::from_secs(3600));
    }
}
