//! Command classification table.
//!
//! The wire format carries no "will reply" flag, so every code is mapped to
//! a [`CommandSpec`] stating whether the firmware answers it and how long to
//! wait. The canonical subset below was measured against the instrument and
//! should be treated as configuration to validate, not as protocol law.
//! Collaborators can extend the table from a TOML file but cannot override
//! canonical entries.
//!
//! ```toml
//! default_timeout_ms = 3000
//!
//! [[command]]
//! code = 0x5001
//! name = "FILTER_WHEEL_SET"
//! expects_response = true
//! timeout_ms = 1500
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use lsctl_core::error::{Error, Result};
use lsctl_core::types::{CommandRequest, DEFAULT_COMMAND_TIMEOUT};

use crate::codes::*;

/// How the firmware treats a command code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub expects_response: bool,
    /// Per-code timeout; `None` uses the table default.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn query(name: &str) -> Self {
        CommandSpec {
            name: name.to_string(),
            expects_response: true,
            timeout: None,
        }
    }

    pub fn fire_and_forget(name: &str) -> Self {
        CommandSpec {
            name: name.to_string(),
            expects_response: false,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Code -> [`CommandSpec`] lookup.
#[derive(Debug, Clone)]
pub struct CommandTable {
    entries: BTreeMap<u32, CommandSpec>,
    canonical: HashSet<u32>,
    default_timeout: Duration,
}

impl CommandTable {
    /// The firmware-defined subset.
    ///
    /// LED commands are all acknowledged. Laser commands are
    /// fire-and-forget apart from explicit queries.
    pub fn canonical() -> Self {
        let entries: BTreeMap<u32, CommandSpec> = [
            (SCOPE_SETTINGS_SAVE, CommandSpec::query("SCOPE_SETTINGS_SAVE")),
            (SCOPE_SETTINGS_LOAD, CommandSpec::query("SCOPE_SETTINGS_LOAD")),
            (LASER_LEVEL_SET, CommandSpec::fire_and_forget("LASER_LEVEL_SET")),
            (LASER_LEVEL_GET, CommandSpec::query("LASER_LEVEL_GET")),
            (
                LASER_PREVIEW_ENABLE,
                CommandSpec::fire_and_forget("LASER_PREVIEW_ENABLE"),
            ),
            (
                LASER_PREVIEW_DISABLE,
                CommandSpec::fire_and_forget("LASER_PREVIEW_DISABLE"),
            ),
            (LASER_ALL_DISABLE, CommandSpec::fire_and_forget("LASER_ALL_DISABLE")),
            (WORKFLOW_START, CommandSpec::query("WORKFLOW_START")),
            (WORKFLOW_STOP, CommandSpec::fire_and_forget("WORKFLOW_STOP")),
            (LED_ON, CommandSpec::query("LED_ON")),
            (LED_OFF, CommandSpec::query("LED_OFF")),
            (LED_LEVEL_SET, CommandSpec::query("LED_LEVEL_SET")),
            (LED_LEVEL_GET, CommandSpec::query("LED_LEVEL_GET")),
            (STAGE_POSITION_SET, CommandSpec::fire_and_forget("STAGE_POSITION_SET")),
            (STAGE_POSITION_GET, CommandSpec::query("STAGE_POSITION_GET")),
            (SYSTEM_STATE_GET, CommandSpec::query("SYSTEM_STATE_GET")),
        ]
        .into_iter()
        .collect();

        let canonical = entries.keys().copied().collect();
        CommandTable {
            entries,
            canonical,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Look up a code.
    pub fn get(&self, code: u32) -> Option<&CommandSpec> {
        self.entries.get(&code)
    }

    /// Whether the firmware replies to `code`. Unknown codes are
    /// fire-and-forget.
    pub fn expects_response(&self, code: u32) -> bool {
        self.get(code).is_some_and(|s| s.expects_response)
    }

    /// Response timeout for `code`.
    pub fn timeout(&self, code: u32) -> Duration {
        self.get(code)
            .and_then(|s| s.timeout)
            .unwrap_or(self.default_timeout)
    }

    /// Timeout for codes without their own.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    /// Display name for logging, `0x....` for unknown codes.
    pub fn name(&self, code: u32) -> String {
        self.get(code)
            .map_or_else(|| format!("0x{code:04X}"), |s| s.name.clone())
    }

    pub fn is_canonical(&self, code: u32) -> bool {
        self.canonical.contains(&code)
    }

    /// A request for `code` pre-classified from this table.
    pub fn request(&self, code: u32) -> CommandRequest {
        CommandRequest::new(code)
            .expects_response(self.expects_response(code))
            .timeout(self.timeout(code))
    }

    /// Add entries. Rejected as a whole if any entry would override a
    /// canonical code or appears twice.
    pub fn extend<I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (u32, CommandSpec)>,
    {
        let mut staged = BTreeMap::new();
        for (code, spec) in entries {
            if self.is_canonical(code) {
                return Err(Error::Config(format!(
                    "code 0x{code:04X} ({}) is firmware-defined and cannot be overridden",
                    self.name(code)
                )));
            }
            if NOTIFICATION_CODES.contains(&code) {
                return Err(Error::Config(format!(
                    "code 0x{code:04X} is notification-only"
                )));
            }
            if staged.insert(code, spec).is_some() {
                return Err(Error::Config(format!("duplicate entry for code 0x{code:04X}")));
            }
        }

        tracing::debug!(added = staged.len(), "extending command table");
        self.entries.extend(staged);
        Ok(())
    }

    /// The canonical table extended with the entries in a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: TableFile =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;

        let mut table = Self::canonical();
        if let Some(ms) = file.default_timeout_ms {
            table.default_timeout = Duration::from_millis(ms);
        }
        table.extend(file.command.into_iter().map(|e| {
            (
                e.code,
                CommandSpec {
                    name: e.name,
                    expects_response: e.expects_response,
                    timeout: e.timeout_ms.map(Duration::from_millis),
                },
            )
        }))?;
        Ok(table)
    }

    /// Load a table extension from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &CommandSpec)> {
        self.entries.iter().map(|(c, s)| (*c, s))
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::canonical()
    }
}

#[derive(Debug, Deserialize)]
struct TableFile {
    default_timeout_ms: Option<u64>,
    #[serde(default)]
    command: Vec<TableEntry>,
}

#[derive(Debug, Deserialize)]
struct TableEntry {
    code: u32,
    name: String,
    expects_response: bool,
    timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn led_family_expects_response() {
        let t = CommandTable::canonical();
        for code in [LED_ON, LED_OFF, LED_LEVEL_SET, LED_LEVEL_GET] {
            assert!(t.expects_response(code), "0x{code:04X}");
        }
    }

    #[test]
    fn laser_family_is_fire_and_forget_except_get() {
        let t = CommandTable::canonical();
        for code in [
            LASER_LEVEL_SET,
            LASER_PREVIEW_ENABLE,
            LASER_PREVIEW_DISABLE,
            LASER_ALL_DISABLE,
        ] {
            assert!(!t.expects_response(code), "0x{code:04X}");
        }
        assert!(t.expects_response(LASER_LEVEL_GET));
    }

    #[test]
    fn workflow_start_acknowledged_stop_not() {
        let t = CommandTable::canonical();
        assert!(t.expects_response(WORKFLOW_START));
        assert!(!t.expects_response(WORKFLOW_STOP));
    }

    #[test]
    fn unknown_code_defaults() {
        let t = CommandTable::canonical();
        assert!(!t.expects_response(0x7777));
        assert_eq!(t.timeout(0x7777), DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(t.name(0x7777), "0x7777");
    }

    #[test]
    fn request_is_classified() {
        let t = CommandTable::canonical();
        let req = t.request(SCOPE_SETTINGS_LOAD);
        assert!(req.expects_response);
        assert_eq!(req.timeout, DEFAULT_COMMAND_TIMEOUT);
        assert!(!t.request(LASER_ALL_DISABLE).expects_response);
    }

    #[test]
    fn extend_adds_new_codes() {
        let mut t = CommandTable::canonical();
        let before = t.len();
        t.extend([(
            0x5001,
            CommandSpec::query("FILTER_WHEEL_SET").with_timeout(Duration::from_millis(1500)),
        )])
        .unwrap();
        assert_eq!(t.len(), before + 1);
        assert!(t.expects_response(0x5001));
        assert_eq!(t.timeout(0x5001), Duration::from_millis(1500));
        assert!(!t.is_canonical(0x5001));
    }

    #[test]
    fn extend_cannot_override_canonical() {
        let mut t = CommandTable::canonical();
        let err = t
            .extend([(LASER_ALL_DISABLE, CommandSpec::query("LASER_ALL_DISABLE"))])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!t.expects_response(LASER_ALL_DISABLE));
    }

    #[test]
    fn default_timeout_applies_to_entries_without_their_own() {
        let mut t = CommandTable::canonical();
        t.set_default_timeout(Duration::from_millis(250));
        assert_eq!(t.timeout(WORKFLOW_START), Duration::from_millis(250));
        assert_eq!(t.request(LED_ON).timeout, Duration::from_millis(250));
    }

    #[test]
    fn extend_is_all_or_nothing() {
        let mut t = CommandTable::canonical();
        let before = t.len();
        let result = t.extend([
            (0x5001, CommandSpec::fire_and_forget("A")),
            (0x5001, CommandSpec::fire_and_forget("B")),
        ]);
        assert!(result.is_err());
        assert_eq!(t.len(), before);
    }

    #[test]
    fn from_toml_extends_canonical() {
        let t = CommandTable::from_toml_str(
            r#"
            default_timeout_ms = 2000

            [[command]]
            code = 0x5001
            name = "FILTER_WHEEL_SET"
            expects_response = true

            [[command]]
            code = 0x5002
            name = "FILTER_WHEEL_HOME"
            expects_response = false
            timeout_ms = 100
            "#,
        )
        .unwrap();
        assert!(t.expects_response(0x5001));
        assert_eq!(t.timeout(0x5001), Duration::from_millis(2000));
        assert_eq!(t.timeout(0x5002), Duration::from_millis(100));
        assert_eq!(t.timeout(0x9999), Duration::from_millis(2000));
        assert!(t.expects_response(WORKFLOW_START));
    }

    #[test]
    fn from_toml_rejects_override() {
        let err = CommandTable::from_toml_str(
            r#"
            [[command]]
            code = 0x3005
            name = "WORKFLOW_STOP"
            expects_response = true
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn from_toml_rejects_malformed() {
        assert!(matches!(
            CommandTable::from_toml_str("[[command]]\ncode = \"x\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn from_file_missing_is_config_error() {
        assert!(matches!(
            CommandTable::from_file("/nonexistent/lsctl-table.toml"),
            Err(Error::Config(_))
        ));
    }
}
