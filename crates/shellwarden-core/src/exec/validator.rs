//! Command validation pipeline
//!
//! Stages run in order and the first failure wins:
//! 1. blocked-command set (exact or token-aware prefix)
//! 2. dangerous-pattern rules
//! 3. path rules (traversal, home shortcuts, sensitive roots)
//!
//! Input is trimmed and lowercased before any stage runs.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{RejectionReason, TerminalError};

struct Rule {
    name: &'static str,
    pattern: Regex,
}

fn rule(name: &'static str, pattern: &str) -> Rule {
    Rule {
        name,
        pattern: Regex::new(pattern).unwrap(),
    }
}

static DANGEROUS_PATTERNS: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule("shell metacharacter", r"[|;&`$]"),
        rule("output redirection", r">\s*[^>\s]+"),
        rule(
            "recursive or forced delete",
            r"\brm\s+(?:\S+\s+)*?(?:-[a-z]*[rf][a-z]*|--recursive|--force)\b",
        ),
        rule(
            "filesystem format or raw disk access",
            r"\b(?:mkfs(?:\.\w+)?|dd|fdisk|sfdisk|parted|wipefs|mkswap)\b",
        ),
        rule(
            "unsafe permission change",
            r"\bchmod\s+(?:-\S+\s+)*(?:0?777|a\+rwx|[ugoa]*\+s)\b",
        ),
        rule(
            "privilege escalation",
            r"\b(?:sudo|su|doas|pkexec|runas)\b",
        ),
        rule(
            "environment mutation",
            r"\b(?:export|unset|setenv|env)\b",
        ),
        rule(
            "command sourcing or evaluation",
            r"(?:^|\s)\.\s|\b(?:source|eval|exec)\b",
        ),
        rule(
            "process control",
            r"\b(?:kill|killall|pkill|xkill|nice|renice|nohup|disown|setsid)\b",
        ),
    ]
});

static PATH_PATTERNS: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule("parent directory traversal", r"\.\."),
        rule("home directory shortcut", r"(?:^|[\s=:'\x22])~"),
        rule(
            "sensitive filesystem root",
            r"/+(?:\./+)*(?:etc|dev|sys|proc|boot|root)(?:[/\s'\x22]|$)",
        ),
    ]
});

/// Stateless pattern rules plus a mutable blocked-command set
#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    blocked: BTreeSet<String>,
}

impl CommandValidator {
    pub fn new<I, S>(blocked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut validator = Self::default();
        for entry in blocked {
            validator.block(entry.as_ref());
        }
        validator
    }

    /// Add an entry to the blocked set. Returns false if it was already there.
    pub fn block(&mut self, command: &str) -> bool {
        let entry = normalize(command);
        if entry.is_empty() {
            return false;
        }
        self.blocked.insert(entry)
    }

    /// Remove an entry from the blocked set. Returns false if it was absent.
    pub fn unblock(&mut self, command: &str) -> bool {
        self.blocked.remove(&normalize(command))
    }

    /// Whether the blocked set alone rejects this command
    pub fn is_blocked(&self, command: &str) -> bool {
        self.blocked_entry(&normalize(command)).is_some()
    }

    pub fn blocked_commands(&self) -> Vec<String> {
        self.blocked.iter().cloned().collect()
    }

    /// Run the full pipeline
    pub fn check(&self, command: &str) -> Result<(), TerminalError> {
        let normalized = normalize(command);

        if normalized.is_empty() {
            return Err(TerminalError::ValidationRejected {
                reason: RejectionReason::DangerousPattern,
                detail: "empty command".to_string(),
            });
        }

        if let Some(entry) = self.blocked_entry(&normalized) {
            return Err(TerminalError::ValidationRejected {
                reason: RejectionReason::Blocked,
                detail: format!("matches blocked command '{}'", entry),
            });
        }

        if let Some(rule) = first_match(&DANGEROUS_PATTERNS, &normalized) {
            return Err(TerminalError::ValidationRejected {
                reason: RejectionReason::DangerousPattern,
                detail: rule.to_string(),
            });
        }

        if let Some(rule) = first_match(&PATH_PATTERNS, &normalized) {
            return Err(TerminalError::ValidationRejected {
                reason: RejectionReason::PathTraversal,
                detail: rule.to_string(),
            });
        }

        Ok(())
    }

    fn blocked_entry(&self, normalized: &str) -> Option<&str> {
        self.blocked
            .iter()
            .find(|entry| is_token_prefix(normalized, entry))
            .map(String::as_str)
    }
}

/// `command` equals `entry`, or starts with it and the next char ends the token
fn is_token_prefix(command: &str, entry: &str) -> bool {
    match command.strip_prefix(entry) {
        Some(rest) => rest.chars().next().map_or(true, |c| !c.is_alphanumeric()),
        None => false,
    }
}

fn first_match(rules: &[Rule], command: &str) -> Option<&'static str> {
    rules
        .iter()
        .find(|r| r.pattern.is_match(command))
        .map(|r| r.name)
}

fn normalize(command: &str) -> String {
    command.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BLOCKED_COMMANDS;

    fn validator() -> CommandValidator {
        CommandValidator::new(DEFAULT_BLOCKED_COMMANDS)
    }

    fn reason(command: &str) -> Option<RejectionReason> {
        match validator().check(command) {
            Ok(()) => None,
            Err(TerminalError::ValidationRejected { reason, .. }) => Some(reason),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_safe_commands() {
        for cmd in [
            "ls -la",
            "pwd",
            "echo hello world",
            "cat notes.txt",
            "git status",
            "sleep 2",
            "printenv",
            "grep -rn address src",
        ] {
            assert_eq!(reason(cmd), None, "{} should pass", cmd);
        }
    }

    #[test]
    fn test_blocked_set() {
        assert_eq!(reason("rm -rf /"), Some(RejectionReason::Blocked));
        assert_eq!(reason("  RM -RF /  "), Some(RejectionReason::Blocked));
        assert_eq!(reason("shutdown -h now"), Some(RejectionReason::Blocked));
        assert_eq!(reason("dd if=/dev/zero of=disk.img"), Some(RejectionReason::Blocked));
        // Token-aware: "ddrescue" does not start with the token "dd"
        assert_ne!(reason("ddrescue in out"), Some(RejectionReason::Blocked));
        assert_eq!(reason("haltless"), None);
    }

    #[test]
    fn test_block_and_unblock() {
        let mut v = validator();
        assert!(v.check("whoami").is_ok());
        assert!(v.block("  WhoAmI "));
        assert!(!v.block("whoami"));
        assert!(v.is_blocked("whoami"));
        assert!(v.check("whoami").is_err());

        assert!(v.unblock("whoami"));
        assert!(!v.unblock("whoami"));
        assert!(v.check("whoami").is_ok());
        assert!(v.blocked_commands().contains(&"mkfs".to_string()));
    }

    #[test]
    fn test_metacharacters_always_rejected() {
        for meta in [";", "|", "&", "`", "$"] {
            let cmd = format!("echo a{}b", meta);
            assert_eq!(
                reason(&cmd),
                Some(RejectionReason::DangerousPattern),
                "{} should be rejected",
                cmd
            );
        }
        assert_eq!(reason("echo $HOME"), Some(RejectionReason::DangerousPattern));
    }

    #[test]
    fn test_dangerous_patterns() {
        for cmd in [
            "echo hi > out.txt",
            "rm -r build",
            "rm --force file",
            "wipefs -a disk.img",
            "chmod 777 script.sh",
            "chmod -R a+rwx dir",
            "sudo ls",
            "su admin",
            "export FOO=bar",
            "unset PATH",
            "source script.sh",
            ". script.sh",
            "eval ls",
            "kill 1234",
            "pkill node",
            "nohup server",
            "renice 10 42",
        ] {
            assert_eq!(
                reason(cmd),
                Some(RejectionReason::DangerousPattern),
                "{} should be rejected",
                cmd
            );
        }
        // Plain rm without force/recursive flags passes
        assert_eq!(reason("rm notes.txt"), None);
    }

    #[test]
    fn test_path_rules() {
        assert_eq!(reason("cat ../secret"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("ls ~"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("cat ~/.ssh/id_rsa"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("cat /etc/passwd"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("ls /proc"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("ls /root/"), Some(RejectionReason::PathTraversal));
        // Repeated separators, dot components and attached option values
        assert_eq!(reason("cat //etc/passwd"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("cat /./etc/passwd"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("grep -f/etc/passwd x"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("head -n 1 //etc/passwd"), Some(RejectionReason::PathTraversal));
        assert_eq!(reason("cat '/etc'"), Some(RejectionReason::PathTraversal));
        // Only well-known roots, not every absolute path
        assert_eq!(reason("ls /tmp"), None);
        assert_eq!(reason("ls /etcetera"), None);
    }

    #[test]
    fn test_empty_command() {
        assert!(validator().check("   ").is_err());
    }

    #[test]
    fn test_pattern_tables_compile() {
        assert_eq!(DANGEROUS_PATTERNS.len(), 9);
        assert_eq!(PATH_PATTERNS.len(), 3);
    }
}
