//! Admission control: the ordered security checks run before any command
//! reaches the runtime.
//!
//! Checks run in a fixed order and short-circuit on the first denial:
//! rate limit, user policy, command policy (injection and homoglyph screens
//! before any pattern matching), dangerous flags, path policy. The order is
//! part of the contract — denial reasons are deterministic and testable.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{PolicyMode, SecurityConfig};
use crate::error::Result;
use crate::homoglyph;
use crate::metrics::METRICS;
use crate::ratelimit::RateLimiter;
use crate::shellparse;

/// Shell interpreters whose `-c` argument gets the inner-command treatment.
const SHELLS: &[&str] = &["sh", "bash", "zsh", "ash", "dash", "ksh", "csh", "tcsh"];

/// Leading commands granted read access to denied paths.
const READ_ONLY_COMMANDS: &[&str] = &["ls", "cat", "head", "tail", "grep", "find"];

/// One admission decision. Produced fresh per request, carries no identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SecurityDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Per-request context the checks evaluate against.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    /// Caller identity the rate limiter keys on.
    pub identifier: String,
    /// Operation name for the per-operation ceiling ("exec", "logs", ...).
    pub operation: String,
    /// Requested user; `None` means the container default (treated as root).
    pub user: Option<String>,
}

/// Composes rate limiting, user, command, flag, and path policy into one
/// admission decision.
pub struct SecurityManager {
    cfg: SecurityConfig,
    limiter: Arc<RateLimiter>,
}

impl SecurityManager {
    pub fn new(cfg: SecurityConfig, limiter: Arc<RateLimiter>) -> Self {
        Self { cfg, limiter }
    }

    /// Rate-limit-only check for operations that carry no command (logs,
    /// inspect). Metered exactly like command admissions.
    pub async fn check_operation(&self, operation: &str, identifier: &str) -> Result<SecurityDecision> {
        let d = self.limiter.check(operation, identifier).await?;
        if !d.allowed {
            METRICS.inc_rate_limit_denials();
            return Ok(SecurityDecision::deny(format!(
                "Rate limit exceeded: {}/{} for {operation}, resets in {}s",
                d.current, d.limit, d.reset_secs
            )));
        }
        Ok(SecurityDecision::allow())
    }

    /// Full admission check for an exec request.
    ///
    /// The rate-limit counter is incremented on every attempt — including
    /// requests a later check denies.
    pub async fn check_command(
        &self,
        cmd: &[String],
        ctx: &SecurityContext,
    ) -> Result<SecurityDecision> {
        // 1. Rate limit (metered always).
        let rate = self.check_operation(&ctx.operation, &ctx.identifier).await?;
        if !rate.allowed {
            return Ok(rate);
        }

        // 2. User policy.
        if let Some(decision) = self.check_user(ctx.user.as_deref()) {
            METRICS.inc_policy_denials();
            return Ok(decision);
        }

        // 3. Command policy.
        if let Some(decision) = self.check_command_policy(cmd) {
            METRICS.inc_policy_denials();
            return Ok(decision);
        }

        // 4. Dangerous flags.
        let joined = cmd.join(" ");
        if let Some(decision) = self.check_denied_flags(&joined) {
            METRICS.inc_policy_denials();
            return Ok(decision);
        }

        // 5. Path policy.
        if let Some(decision) = self.check_path_policy(cmd, &joined) {
            METRICS.inc_policy_denials();
            return Ok(decision);
        }

        Ok(SecurityDecision::allow())
    }

    fn check_user(&self, user: Option<&str>) -> Option<SecurityDecision> {
        if self.cfg.allow_root {
            return None;
        }
        let is_root = matches!(user, None | Some("root") | Some("0") | Some(""));
        is_root.then(|| {
            SecurityDecision::deny("root execution is disabled; set an unprivileged user")
        })
    }

    fn check_command_policy(&self, cmd: &[String]) -> Option<SecurityDecision> {
        let commands_to_check: Vec<String> = match extract_shell_inner(cmd) {
            Some(inner) => {
                // Injection and homoglyph screens run before any pattern
                // evaluation and regardless of policy mode.
                if let Some(decision) = screen_inner_command(inner) {
                    return Some(decision);
                }
                shellparse::parse(inner).commands
            }
            None => vec![cmd.join(" ")],
        };

        match self.cfg.policy_mode {
            PolicyMode::None => None,
            PolicyMode::Allowlist => {
                for command in &commands_to_check {
                    let matched = self
                        .cfg
                        .command_patterns
                        .iter()
                        .any(|p| pattern_matches(p, command));
                    if !matched {
                        return Some(SecurityDecision::deny(format!(
                            "command not in allowlist: {command}"
                        )));
                    }
                }
                None
            }
            PolicyMode::Denylist => {
                for command in &commands_to_check {
                    if let Some(pattern) = self
                        .cfg
                        .command_patterns
                        .iter()
                        .find(|p| pattern_matches(p, command))
                    {
                        return Some(SecurityDecision::deny(format!(
                            "command matches denylist pattern '{pattern}': {command}"
                        )));
                    }
                }
                None
            }
        }
    }

    fn check_denied_flags(&self, joined: &str) -> Option<SecurityDecision> {
        self.cfg
            .denied_flags
            .iter()
            .find(|flag| !flag.is_empty() && joined.contains(flag.as_str()))
            .map(|flag| SecurityDecision::deny(format!("denied flag present: {flag}")))
    }

    /// Denied-path check with a read-only exemption.
    ///
    /// The exemption is substring-based by design: redirection targets are
    /// not parsed separately, so any write/redirect token anywhere in the
    /// command withdraws the exemption even when the denied path is only a
    /// read source.
    fn check_path_policy(&self, cmd: &[String], joined: &str) -> Option<SecurityDecision> {
        let denied = self
            .cfg
            .denied_paths
            .iter()
            .find(|p| !p.is_empty() && joined.contains(p.as_str()))?;

        let lead = cmd
            .first()
            .map(|c| basename(c))
            .unwrap_or_default();
        let read_only_lead = READ_ONLY_COMMANDS.contains(&lead);
        let has_write_tokens = joined.contains('>') || joined.contains(" tee ");

        if read_only_lead && !has_write_tokens {
            return None;
        }
        Some(SecurityDecision::deny(format!(
            "access to denied path {denied} (read-only exemption {})",
            if read_only_lead {
                "withdrawn: write tokens present"
            } else {
                "not applicable"
            }
        )))
    }
}

/// The inner string of `sh -c "..."`-style invocations, if present.
fn extract_shell_inner(cmd: &[String]) -> Option<&str> {
    let first = cmd.first()?;
    if !SHELLS.contains(&basename(first)) {
        return None;
    }
    let c_pos = cmd.iter().position(|a| a == "-c")?;
    cmd.get(c_pos + 1).map(String::as_str)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Injection and homoglyph screens for a shell `-c` inner string.
///
/// Cannot be bypassed by policy mode; runs against both the raw string and
/// its homoglyph-normalised form.
fn screen_inner_command(inner: &str) -> Option<SecurityDecision> {
    let report = homoglyph::screen(inner);
    if report.flagged {
        return Some(SecurityDecision::deny(format!(
            "obfuscated command: {} confusable character(s), scripts {:?}",
            report.confusables.len(),
            report
                .scripts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        )));
    }

    let normalized = homoglyph::normalize(inner);
    for (label, re) in injection_signatures() {
        if re.is_match(inner) || re.is_match(&normalized) {
            return Some(SecurityDecision::deny(format!(
                "shell injection signature: {label}"
            )));
        }
    }
    None
}

/// Shell-metacharacter sequences preceding destructive commands. Each match
/// alone is sufficient to deny.
fn injection_signatures() -> &'static Vec<(&'static str, Regex)> {
    static SIGNATURES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        let table: &[(&str, &str)] = &[
            ("chained recursive delete", r"(?i)[;&|]\s*rm\s+-[a-z]*r[a-z]*f"),
            ("chained device overwrite", r"(?i)[;&|]\s*dd\s+if="),
            ("backtick destructive command", r"(?i)`[^`]*rm\s+-[a-z]*r[a-z]*f[^`]*`"),
            (
                "substituted destructive command",
                r"(?i)\$\([^)]*rm\s+-[a-z]*r[a-z]*f[^)]*\)",
            ),
            ("chained shutdown", r"(?i)[;&|]\s*(?:shutdown|reboot|halt|poweroff)\b"),
            ("redirect to block device", r"(?i)>\s*/dev/(?:sd|hd|nvme|vd)"),
            ("chained filesystem format", r"(?i)[;&|]\s*mkfs"),
            ("chained forced kill", r"(?i)[;&|]\s*kill(?:all)?\s+-(?:9|kill)\b"),
        ];
        table
            .iter()
            .filter_map(|(label, pattern)| Regex::new(pattern).ok().map(|re| (*label, re)))
            .collect()
    })
}

/// Try an entry as a case-insensitive regex; fall back to case-insensitive
/// substring match when the entry is not a valid expression.
fn pattern_matches(entry: &str, command: &str) -> bool {
    match Regex::new(&format!("(?i){entry}")) {
        Ok(re) => re.is_match(command),
        Err(_) => command.to_lowercase().contains(&entry.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::ratelimit::backend_from_config;

    fn manager(cfg: SecurityConfig) -> SecurityManager {
        manager_with_limit(cfg, RateLimitConfig::default())
    }

    fn manager_with_limit(cfg: SecurityConfig, rate: RateLimitConfig) -> SecurityManager {
        let backend = backend_from_config(&rate);
        SecurityManager::new(cfg, Arc::new(RateLimiter::new(rate, backend)))
    }

    fn ctx() -> SecurityContext {
        SecurityContext {
            identifier: "test-caller".into(),
            operation: "exec".into(),
            user: Some("appuser".into()),
        }
    }

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_denylist_pattern_denies() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::Denylist,
            command_patterns: vec!["rm -rf".into()],
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(&cmd(&["rm", "-rf", "/"]), &ctx())
            .await
            .expect("check");
        assert!(!d.allowed);
        assert!(d.reason.unwrap_or_default().contains("denylist"));
    }

    #[tokio::test]
    async fn test_allowlist_allows_matching_denies_rest() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::Allowlist,
            command_patterns: vec!["^ls".into()],
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(&cmd(&["ls", "-la"]), &ctx())
            .await
            .expect("check");
        assert!(d.allowed, "{:?}", d.reason);

        let d = mgr
            .check_command(&cmd(&["whoami"]), &ctx())
            .await
            .expect("check");
        assert!(!d.allowed);
        assert!(d.reason.unwrap_or_default().contains("allowlist"));
    }

    #[tokio::test]
    async fn test_invalid_regex_falls_back_to_substring() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::Denylist,
            command_patterns: vec!["rm -rf [".into()], // invalid regex
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(&cmd(&["rm", "-rf", "[", "x"]), &ctx())
            .await
            .expect("check");
        assert!(!d.allowed);
    }

    #[tokio::test]
    async fn test_root_denied_by_default() {
        let mgr = manager(SecurityConfig::default());
        for user in [None, Some("root"), Some("0"), Some("")] {
            let mut context = ctx();
            context.user = user.map(str::to_string);
            let d = mgr
                .check_command(&cmd(&["ls"]), &context)
                .await
                .expect("check");
            assert!(!d.allowed, "user {user:?} should be denied");
            assert!(d.reason.unwrap_or_default().contains("root"));
        }
    }

    #[tokio::test]
    async fn test_root_allowed_when_enabled() {
        let mgr = manager(SecurityConfig {
            allow_root: true,
            policy_mode: PolicyMode::None,
            ..SecurityConfig::default()
        });
        let mut context = ctx();
        context.user = None;
        let d = mgr
            .check_command(&cmd(&["ls"]), &context)
            .await
            .expect("check");
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_rate_limit_denies_over_ceiling_and_meters_always() {
        let mgr = manager_with_limit(
            SecurityConfig::default(),
            RateLimitConfig {
                exec_limit: 2,
                ..RateLimitConfig::default()
            },
        );
        // Root-denied requests still consume rate budget.
        let mut context = ctx();
        context.user = None;
        for _ in 0..2 {
            let d = mgr
                .check_command(&cmd(&["ls"]), &context)
                .await
                .expect("check");
            assert!(d.reason.unwrap_or_default().contains("root"));
        }
        let d = mgr
            .check_command(&cmd(&["ls"]), &context)
            .await
            .expect("check");
        assert!(d.reason.unwrap_or_default().contains("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn test_injection_screen_not_bypassed_by_mode_none() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::None,
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(
                &cmd(&["sh", "-c", "echo hi; rm -rf /var/data"]),
                &ctx(),
            )
            .await
            .expect("check");
        assert!(!d.allowed);
        assert!(d.reason.unwrap_or_default().contains("injection"));
    }

    #[tokio::test]
    async fn test_homoglyph_obfuscation_denied() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::None,
            ..SecurityConfig::default()
        });
        // Cyrillic "е" and "о" in "echo"
        let d = mgr
            .check_command(
                &cmd(&["bash", "-c", "\u{0435}ch\u{043E} pwned"]),
                &ctx(),
            )
            .await
            .expect("check");
        assert!(!d.allowed);
        assert!(d.reason.unwrap_or_default().contains("obfuscated"));
    }

    #[tokio::test]
    async fn test_shell_inner_subcommands_matched_against_denylist() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::Denylist,
            command_patterns: vec!["curl".into()],
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(
                &cmd(&["bash", "-c", "echo start && curl example.com"]),
                &ctx(),
            )
            .await
            .expect("check");
        assert!(!d.allowed);
    }

    #[tokio::test]
    async fn test_denied_flag_substring() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::None,
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(&cmd(&["docker", "run", "--privileged", "img"]), &ctx())
            .await
            .expect("check");
        assert!(!d.allowed);
        assert!(d.reason.unwrap_or_default().contains("--privileged"));
    }

    #[tokio::test]
    async fn test_denied_path_blocked_for_writes() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::None,
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(&cmd(&["rm", "/proc/sys/kernel/something"]), &ctx())
            .await
            .expect("check");
        assert!(!d.allowed);
        assert!(d.reason.unwrap_or_default().contains("/proc"));
    }

    #[tokio::test]
    async fn test_denied_path_read_only_exemption() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::None,
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(&cmd(&["cat", "/proc/meminfo"]), &ctx())
            .await
            .expect("check");
        assert!(d.allowed, "{:?}", d.reason);
    }

    #[tokio::test]
    async fn test_read_only_exemption_withdrawn_on_redirect() {
        let mgr = manager(SecurityConfig {
            policy_mode: PolicyMode::None,
            ..SecurityConfig::default()
        });
        let d = mgr
            .check_command(&cmd(&["cat", "/proc/meminfo", ">", "/tmp/out"]), &ctx())
            .await
            .expect("check");
        assert!(!d.allowed);
        assert!(d.reason.unwrap_or_default().contains("withdrawn"));
    }

    #[tokio::test]
    async fn test_check_order_rate_limit_before_user() {
        let mgr = manager_with_limit(
            SecurityConfig::default(),
            RateLimitConfig {
                exec_limit: 0,
                ..RateLimitConfig::default()
            },
        );
        let mut context = ctx();
        context.user = None; // would be denied as root, but rate fires first
        let d = mgr
            .check_command(&cmd(&["ls"]), &context)
            .await
            .expect("check");
        assert!(d.reason.unwrap_or_default().contains("Rate limit"));
    }

    #[test]
    fn test_extract_shell_inner() {
        let c = cmd(&["/bin/bash", "-c", "echo hi"]);
        assert_eq!(extract_shell_inner(&c), Some("echo hi"));
        let c = cmd(&["python3", "-c", "print(1)"]);
        assert_eq!(extract_shell_inner(&c), None);
        let c = cmd(&["bash", "script.sh"]);
        assert_eq!(extract_shell_inner(&c), None);
    }

    #[test]
    fn test_injection_signatures_compile() {
        assert_eq!(injection_signatures().len(), 8);
    }
}
