//! State Manager - canonical per-session terminal state plus a diff log
//!
//! Every update is diffed against the current state first. Only a category
//! that actually changes is merged, and only then is a [`StateChange`]
//! appended to the log.
//!
//! Both the log and the command history are bounded by `max_history_size`,
//! oldest first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::StateConfig;
use crate::error::{Result, TerminalError};
use crate::types::{StateChange, StateDelta, StatePatch, TerminalState};

pub struct StateManager {
    current: TerminalState,
    history: VecDeque<StateChange>,
    max_history_size: usize,
    /// Entries of `current.command_history`, for the duplicate check
    known_commands: HashSet<String>,
}

impl Default for StateManager {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self::new(cwd.to_string_lossy(), std::process::id(), StateConfig::default())
    }
}

impl StateManager {
    /// Initial state: the given cwd, the inherited environment, no history
    /// and a process tree of `[pid]`
    pub fn new(cwd: impl Into<String>, pid: u32, config: StateConfig) -> Self {
        Self {
            current: TerminalState {
                cwd: cwd.into(),
                env: std::env::vars().collect(),
                command_history: Vec::new(),
                process_tree: vec![pid],
            },
            history: VecDeque::new(),
            max_history_size: config.max_history_size,
            known_commands: HashSet::new(),
        }
    }

    /// Diff-apply a partial update. Returns the changes that were recorded.
    pub fn update_state(&mut self, patch: StatePatch) -> Vec<StateChange> {
        let timestamp = Utc::now().timestamp_millis();
        let mut recorded = Vec::new();

        for delta in self.diff(patch) {
            self.apply(&delta);
            let change = StateChange { delta, timestamp };
            self.push_change(change.clone());
            recorded.push(change);
        }

        if !recorded.is_empty() {
            debug!(changes = recorded.len(), "Terminal state updated");
        }
        recorded
    }

    /// Replace the canonical state, recording one change per category
    pub fn restore(&mut self, snapshot: TerminalState) {
        let timestamp = Utc::now().timestamp_millis();
        for delta in [
            StateDelta::Cwd(snapshot.cwd.clone()),
            StateDelta::Env(snapshot.env.clone()),
            StateDelta::Command(snapshot.command_history.clone()),
            StateDelta::Process(snapshot.process_tree.clone()),
        ] {
            self.push_change(StateChange { delta, timestamp });
        }
        self.known_commands = snapshot.command_history.iter().cloned().collect();
        self.current = snapshot;
        info!(cwd = %self.current.cwd, "Terminal state restored");
    }

    /// Shape-check an untyped snapshot, then [`restore`](Self::restore) it
    pub fn restore_value(&mut self, snapshot: &Value) -> Result<()> {
        validate_snapshot(snapshot)?;
        let snapshot: TerminalState = serde_json::from_value(snapshot.clone())
            .map_err(|e| TerminalError::SnapshotInvalid(e.to_string()))?;
        self.restore(snapshot);
        Ok(())
    }

    // ========== Accessors ==========

    pub fn get_snapshot(&self) -> TerminalState {
        self.current.clone()
    }

    pub fn get_state_history(&self) -> Vec<StateChange> {
        self.history.iter().cloned().collect()
    }

    pub fn track_changes(&self) -> Vec<StateChange> {
        self.get_state_history()
    }

    pub fn get_current_working_directory(&self) -> String {
        self.current.cwd.clone()
    }

    pub fn get_environment_variables(&self) -> HashMap<String, String> {
        self.current.env.clone()
    }

    pub fn get_command_history(&self) -> Vec<String> {
        self.current.command_history.clone()
    }

    pub fn get_process_tree(&self) -> Vec<u32> {
        self.current.process_tree.clone()
    }

    // ========== History ==========

    /// Change the log bound, pruning the oldest entries immediately
    pub fn set_max_history_size(&mut self, size: usize) {
        self.max_history_size = size;
        self.prune();
        self.trim_commands();
    }

    pub fn get_max_history_size(&self) -> usize {
        self.max_history_size
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn diff(&self, patch: StatePatch) -> Vec<StateDelta> {
        let mut deltas = Vec::new();

        if let Some(cwd) = patch.cwd {
            if cwd != self.current.cwd {
                deltas.push(StateDelta::Cwd(cwd));
            }
        }

        if let Some(env) = patch.env {
            let changed: HashMap<String, String> = env
                .into_iter()
                .filter(|(k, v)| self.current.env.get(k) != Some(v))
                .collect();
            if !changed.is_empty() {
                deltas.push(StateDelta::Env(changed));
            }
        }

        if let Some(commands) = patch.command_history {
            let mut seen = HashSet::new();
            let new_commands: Vec<String> = commands
                .into_iter()
                .filter(|cmd| !self.known_commands.contains(cmd) && seen.insert(cmd.clone()))
                .collect();
            if !new_commands.is_empty() {
                deltas.push(StateDelta::Command(new_commands));
            }
        }

        if let Some(pids) = patch.process_tree {
            let mut new_pids: Vec<u32> = Vec::new();
            for pid in pids {
                if !self.current.process_tree.contains(&pid) && !new_pids.contains(&pid) {
                    new_pids.push(pid);
                }
            }
            if !new_pids.is_empty() {
                deltas.push(StateDelta::Process(new_pids));
            }
        }

        deltas
    }

    fn apply(&mut self, delta: &StateDelta) {
        match delta {
            StateDelta::Cwd(cwd) => self.current.cwd = cwd.clone(),
            StateDelta::Env(env) => self
                .current
                .env
                .extend(env.iter().map(|(k, v)| (k.clone(), v.clone()))),
            StateDelta::Command(cmds) => {
                self.current.command_history.extend(cmds.iter().cloned());
                self.known_commands.extend(cmds.iter().cloned());
                self.trim_commands();
            }
            StateDelta::Process(pids) => self.current.process_tree.extend(pids.iter().copied()),
        }
    }

    fn push_change(&mut self, change: StateChange) {
        self.history.push_back(change);
        self.prune();
    }

    fn prune(&mut self) {
        while self.history.len() > self.max_history_size {
            self.history.pop_front();
        }
    }

    fn trim_commands(&mut self) {
        let excess = self
            .current
            .command_history
            .len()
            .saturating_sub(self.max_history_size);
        if excess == 0 {
            return;
        }
        for cmd in self.current.command_history.drain(..excess) {
            self.known_commands.remove(&cmd);
        }
    }
}

/// Structural check of an untyped snapshot
pub fn validate_snapshot(snapshot: &Value) -> Result<()> {
    let invalid = |msg: &str| Err(TerminalError::SnapshotInvalid(msg.to_string()));

    let Some(obj) = snapshot.as_object() else {
        return invalid("snapshot must be an object");
    };

    if !obj.get("cwd").map_or(false, Value::is_string) {
        return invalid("cwd must be a string");
    }

    match obj.get("env").and_then(Value::as_object) {
        Some(env) if env.values().all(Value::is_string) => {}
        _ => return invalid("env must be an object of strings"),
    }

    match obj.get("commandHistory").and_then(Value::as_array) {
        Some(cmds) if cmds.iter().all(Value::is_string) => {}
        _ => return invalid("commandHistory must be an array of strings"),
    }

    match obj.get("processTree").and_then(Value::as_array) {
        Some(pids)
            if pids
                .iter()
                .all(|p| p.as_u64().map_or(false, |n| n <= u32::MAX as u64)) => {}
        _ => return invalid("processTree must be an array of process ids"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> StateManager {
        StateManager::new("/home/dev", 100, StateConfig::default())
    }

    #[test]
    fn test_initial_state() {
        let m = manager();
        let snap = m.get_snapshot();
        assert_eq!(snap.cwd, "/home/dev");
        assert_eq!(snap.process_tree, vec![100]);
        assert!(snap.command_history.is_empty());
        assert_eq!(snap.env.len(), std::env::vars().count());
        assert!(m.get_state_history().is_empty());
        assert_eq!(m.get_max_history_size(), 1000);
    }

    #[test]
    fn test_cwd_update() {
        let mut m = manager();
        m.update_state(StatePatch::cwd("/tmp"));
        assert_eq!(m.get_current_working_directory(), "/tmp");

        let history = m.get_state_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].delta, StateDelta::Cwd("/tmp".to_string()));
    }

    #[test]
    fn test_no_op_update_records_nothing() {
        let mut m = manager();
        let recorded = m.update_state(StatePatch::cwd("/home/dev"));
        assert!(recorded.is_empty());
        assert!(m.update_state(StatePatch::processes(vec![100])).is_empty());
        assert!(m.update_state(StatePatch::default()).is_empty());
        assert!(m.get_state_history().is_empty());
    }

    #[test]
    fn test_env_delta() {
        let mut m = manager();
        m.update_state(StatePatch::env(HashMap::from([(
            "SHELLWARDEN_TEST_A".to_string(),
            "1".to_string(),
        )])));

        // Only the key whose value differs is recorded
        let recorded = m.update_state(StatePatch::env(HashMap::from([
            ("SHELLWARDEN_TEST_A".to_string(), "1".to_string()),
            ("SHELLWARDEN_TEST_B".to_string(), "2".to_string()),
        ])));
        assert_eq!(recorded.len(), 1);
        assert_eq!(
            recorded[0].delta,
            StateDelta::Env(HashMap::from([(
                "SHELLWARDEN_TEST_B".to_string(),
                "2".to_string()
            )]))
        );
        let env = m.get_environment_variables();
        assert_eq!(env["SHELLWARDEN_TEST_A"], "1");
        assert_eq!(env["SHELLWARDEN_TEST_B"], "2");
    }

    #[test]
    fn test_commands_and_processes() {
        let mut m = manager();
        m.update_state(StatePatch::commands(["ls", "pwd"]));
        let recorded = m.update_state(StatePatch::commands(["pwd", "whoami"]));
        assert_eq!(recorded[0].delta, StateDelta::Command(vec!["whoami".to_string()]));
        assert_eq!(m.get_command_history(), vec!["ls", "pwd", "whoami"]);

        m.update_state(StatePatch::processes(vec![100, 200, 200, 300]));
        assert_eq!(m.get_process_tree(), vec![100, 200, 300]);
    }

    #[test]
    fn test_multi_field_patch() {
        let mut m = manager();
        let recorded = m.update_state(StatePatch {
            cwd: Some("/srv".to_string()),
            command_history: Some(vec!["make".to_string()]),
            process_tree: Some(vec![100]),
            ..Default::default()
        });
        let kinds: Vec<&str> = recorded.iter().map(|c| c.delta.kind()).collect();
        assert_eq!(kinds, vec!["cwd", "command"]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut m = manager();
        m.set_max_history_size(3);
        for i in 0..10 {
            m.update_state(StatePatch::cwd(format!("/dir{}", i)));
            assert!(m.get_state_history().len() <= 3);
        }
        let history = m.track_changes();
        assert_eq!(history[0].delta, StateDelta::Cwd("/dir7".to_string()));

        m.set_max_history_size(1);
        assert_eq!(m.get_state_history().len(), 1);
        m.clear_history();
        assert!(m.get_state_history().is_empty());
        // Clearing the log leaves the state alone
        assert_eq!(m.get_current_working_directory(), "/dir9");
    }

    #[test]
    fn test_command_history_is_bounded() {
        let mut m = manager();
        m.set_max_history_size(3);
        for i in 0..10 {
            m.update_state(StatePatch::commands([format!("chunk {}", i)]));
        }
        assert_eq!(m.get_command_history(), vec!["chunk 7", "chunk 8", "chunk 9"]);

        // Still deduplicated against what is kept
        assert!(m.update_state(StatePatch::commands(["chunk 9"])).is_empty());
        // An evicted entry counts as new again
        assert_eq!(m.update_state(StatePatch::commands(["chunk 0"])).len(), 1);
        assert_eq!(m.get_command_history(), vec!["chunk 8", "chunk 9", "chunk 0"]);

        m.set_max_history_size(1);
        assert_eq!(m.get_command_history(), vec!["chunk 0"]);
        assert_eq!(m.update_state(StatePatch::commands(["chunk 8"])).len(), 1);
    }

    #[test]
    fn test_restore_roundtrip() {
        let mut m = manager();
        let snapshot = TerminalState {
            cwd: "/var/tmp".to_string(),
            env: HashMap::from([("A".to_string(), "b".to_string())]),
            command_history: vec!["ls".to_string()],
            process_tree: vec![1, 2, 3],
        };
        m.restore(snapshot.clone());
        assert_eq!(m.get_snapshot(), snapshot);

        let kinds: Vec<&str> = m.get_state_history().iter().map(|c| c.delta.kind()).collect();
        assert_eq!(kinds, vec!["cwd", "env", "command", "process"]);
    }

    #[test]
    fn test_restore_value() {
        let mut m = manager();
        let value = json!({
            "cwd": "/opt",
            "env": {"K": "v"},
            "commandHistory": ["a", "b"],
            "processTree": [10, 11]
        });
        m.restore_value(&value).unwrap();
        assert_eq!(serde_json::to_value(m.get_snapshot()).unwrap(), value);
    }

    #[test]
    fn test_invalid_snapshots() {
        let mut m = manager();
        let before = m.get_snapshot();

        for bad in [
            json!("not an object"),
            json!({"env": {}, "commandHistory": [], "processTree": []}),
            json!({"cwd": "/", "env": {"K": 1}, "commandHistory": [], "processTree": []}),
            json!({"cwd": "/", "env": {}, "commandHistory": [1], "processTree": []}),
            json!({"cwd": "/", "env": {}, "commandHistory": [], "processTree": [-1]}),
            json!({"cwd": "/", "env": {}, "commandHistory": [], "processTree": ["1"]}),
        ] {
            let err = m.restore_value(&bad).unwrap_err();
            assert!(matches!(err, TerminalError::SnapshotInvalid(_)), "{}", bad);
        }

        assert_eq!(m.get_snapshot(), before);
        assert!(m.get_state_history().is_empty());
    }
}
