//! Loading [`SessionSettings`](crate::SessionSettings) from a TOML configuration file.
//!
//! The key names recognized here (`BeginString`, `SenderCompID`, `SocketHost`, ...) mirror the
//! string-keyed settings a FIX client traditionally reads out of an INI-style config file, one
//! section per gateway. We keep the same key vocabulary but express the file itself with
//! `serde` + `toml`, the pack's idiomatic equivalent of a typed, string-keyed settings file,
//! rather than hand-rolling a parser for the original `configparser` format.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{ApplicationError, SessionSettings};

#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "BeginString")]
    begin_string: Option<String>,
    #[serde(rename = "SenderCompID")]
    sender_comp_id: String,
    #[serde(rename = "TargetCompID")]
    target_comp_id: String,
    #[serde(rename = "SenderPassword")]
    sender_password: Option<String>,
    #[serde(rename = "SocketHost")]
    socket_host: String,
    #[serde(rename = "SocketPort")]
    socket_port: u16,
    #[serde(rename = "HeartBeatInterval")]
    heart_beat_interval: Option<u64>,
    #[serde(rename = "ResetSeqNum")]
    reset_seq_num: Option<ResetSeqNumFlag>,
    #[serde(rename = "MaxReconnectAttempts")]
    max_reconnect_attempts: Option<u32>,
    #[serde(rename = "ReconnectInterval")]
    reconnect_interval: Option<u64>,
    #[serde(rename = "MaxMissedHeartBeats")]
    max_missed_heart_beats: Option<u32>,
    #[serde(rename = "LogonTimeout")]
    logon_timeout: Option<u64>,
    #[serde(rename = "ReplayWindow")]
    replay_window: Option<u32>,
    #[serde(rename = "FileLogPath")]
    file_log_path: PathBuf,
    #[serde(rename = "StorePath")]
    store_path: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ResetSeqNumFlag {
    Y,
    N,
}

impl From<ResetSeqNumFlag> for bool {
    fn from(flag: ResetSeqNumFlag) -> bool {
        matches!(flag, ResetSeqNumFlag::Y)
    }
}

/// Read the config keys listed in the crate-level docs (`BeginString`, `SenderCompID`,
/// `TargetCompID`, `SenderPassword`, `SocketHost`, `SocketPort`, `HeartBeatInterval`,
/// `ResetSeqNum`, `MaxReconnectAttempts`, `ReconnectInterval`, `MaxMissedHeartBeats`,
/// `LogonTimeout`, `ReplayWindow`, `FileLogPath`, `StorePath`) from a TOML file at `path` and
/// build a [`SessionSettings`] from them.
pub(crate) fn from_path(path: &Path) -> Result<SessionSettings, ApplicationError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ApplicationError::ConfigError(format!("{}: {e}", path.display())))?;
    from_str(&text)
}

fn from_str(text: &str) -> Result<SessionSettings, ApplicationError> {
    let raw: RawConfig =
        toml::from_str(text).map_err(|e| ApplicationError::ConfigError(e.to_string()))?;

    let addr: SocketAddr = format!("{}:{}", raw.socket_host, raw.socket_port)
        .parse()
        .map_err(|e| ApplicationError::ConfigError(format!("SocketHost/SocketPort: {e}")))?;

    let mut builder = SessionSettings::builder()
        .with_sender_comp_id(&raw.sender_comp_id)
        .with_target_comp_id(&raw.target_comp_id)
        .with_socket_addr(addr)
        .with_store_path(raw.store_path)
        .with_log_dir(raw.file_log_path);

    if let Some(begin_string) = raw.begin_string {
        builder = builder.with_begin_string(&begin_string);
    }
    if let Some(password) = raw.sender_password {
        builder = builder.with_password(&password);
    }
    if let Some(secs) = raw.heart_beat_interval {
        builder = builder.with_heartbeat_timeout(Duration::from_secs(secs));
    }
    if let Some(reset_seq_num) = raw.reset_seq_num {
        builder = builder.with_reset_seq_num(reset_seq_num.into());
    }
    if let Some(max_reconnect_attempts) = raw.max_reconnect_attempts {
        builder = builder.with_max_reconnect_attempts(max_reconnect_attempts);
    }
    if let Some(secs) = raw.reconnect_interval {
        builder = builder.with_reconnect_interval(Duration::from_secs(secs));
    }
    if let Some(max_missed_heartbeats) = raw.max_missed_heart_beats {
        builder = builder.with_max_missed_heartbeats(max_missed_heartbeats);
    }
    if let Some(secs) = raw.logon_timeout {
        builder = builder.with_logon_timeout(Duration::from_secs(secs));
    }
    if let Some(replay_window) = raw.replay_window {
        builder = builder.with_replay_window(replay_window);
    }

    builder.build()
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
        BeginString = "FIX.4.4"
        SenderCompID = "CLIENT"
        TargetCompID = "SRV"
        SenderPassword = "hunter2"
        SocketHost = "127.0.0.1"
        SocketPort = 5001
        HeartBeatInterval = 30
        ResetSeqNum = "Y"
        MaxReconnectAttempts = 5
        ReconnectInterval = 5
        MaxMissedHeartBeats = 2
        LogonTimeout = 10
        ReplayWindow = 10000
        FileLogPath = "./log"
        StorePath = "./store.db"
    "#;

    #[test]
    fn parses_full_config() {
        let settings = from_str(SAMPLE).unwrap();
        assert_eq!(settings.sender_comp_id, "CLIENT");
        assert_eq!(settings.target_comp_id, "SRV");
        assert_eq!(settings.addr, "127.0.0.1:5001".parse().unwrap());
        assert_eq!(*settings.begin_string, "FIX.4.4");
        assert_eq!(settings.password.as_deref(), Some("hunter2"));
        assert!(settings.reset_seq_num);
        assert_eq!(settings.max_reconnect_attempts, 5);
        assert_eq!(settings.reconnect_interval, Duration::from_secs(5));
        assert_eq!(settings.max_missed_heartbeats, 2);
        assert_eq!(settings.logon_timeout, Duration::from_secs(10));
        assert_eq!(settings.replay_window, Some(10000));
    }

    #[test]
    fn defaults_optional_keys() {
        let minimal = r#"
            SenderCompID = "CLIENT"
            TargetCompID = "SRV"
            SocketHost = "127.0.0.1"
            SocketPort = 5001
            FileLogPath = "./log"
            StorePath = "./store.db"
        "#;
        let settings = from_str(minimal).unwrap();
        assert_eq!(*settings.begin_string, "FIX.4.4");
        assert!(!settings.reset_seq_num);
        assert_eq!(settings.max_reconnect_attempts, 0);
        assert!(settings.password.is_none());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(from_str("not valid toml =").is_err());
    }

    #[test]
    fn rejects_missing_required_key() {
        let missing_target = r#"
            SenderCompID = "CLIENT"
            SocketHost = "127.0.0.1"
            SocketPort = 5001
            FileLogPath = "./log"
            StorePath = "./store.db"
        "#;
        assert!(from_str(missing_target).is_err());
    }
}
