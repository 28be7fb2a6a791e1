//! Scope settings retrieved from the instrument.
//!
//! The firmware answers [`SCOPE_SETTINGS_LOAD`] with its settings as text in
//! the trailing payload: `key = value` or `key: value` lines, grouped under
//! `<Section>` headers.

use std::collections::BTreeMap;

use bytes::Bytes;

use lsctl_core::error::{Error, Result};
use lsctl_protocol::codes::SCOPE_SETTINGS_LOAD;

use crate::dispatcher::CommandDispatcher;

/// A snapshot of the instrument's scope settings.
#[derive(Debug, Clone, Default)]
pub struct ScopeSettings {
    raw: Bytes,
    entries: BTreeMap<String, String>,
}

impl ScopeSettings {
    /// Parse a settings payload. Lines that are neither `key = value` nor
    /// `key: value` are kept in [`raw`](ScopeSettings::raw) only.
    pub fn parse(raw: Bytes) -> Self {
        let text = String::from_utf8_lossy(&raw);
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('<') {
                continue;
            }
            let Some(split) = line.find(['=', ':']) else {
                continue;
            };
            let key = line[..split].trim();
            let value = line[split + 1..].trim();
            if !key.is_empty() {
                entries
                    .entry(key.to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        ScopeSettings { raw, entries }
    }

    /// Value for `key`. The first occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The payload exactly as received.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Retrieve settings through an ordinary correlated request.
pub(crate) async fn retrieve(dispatcher: &CommandDispatcher) -> Result<ScopeSettings> {
    let reply = dispatcher
        .query(dispatcher.request(SCOPE_SETTINGS_LOAD))
        .await?;
    if reply.payload.is_empty() {
        return Err(Error::Protocol("settings reply carried no payload".into()));
    }

    let settings = ScopeSettings::parse(reply.payload);
    tracing::debug!(
        bytes = settings.raw().len(),
        entries = settings.len(),
        "scope settings retrieved"
    );
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_both_separators_and_skip_headers() {
        let settings = ScopeSettings::parse(Bytes::from_static(
            b"<Optics>\nObjective = 10x\nZoom: 1.25\n\n<Stage>\nSpeedX=2.5\nnot a setting\n",
        ));
        assert_eq!(settings.get("Objective"), Some("10x"));
        assert_eq!(settings.get("Zoom"), Some("1.25"));
        assert_eq!(settings.get("SpeedX"), Some("2.5"));
        assert_eq!(settings.get("<Optics>"), None);
        assert_eq!(settings.len(), 3);
    }

    #[test]
    fn first_occurrence_wins() {
        let settings = ScopeSettings::parse(Bytes::from_static(b"a = 1\na = 2\n"));
        assert_eq!(settings.get("a"), Some("1"));
    }

    #[test]
    fn value_may_contain_separator() {
        let settings = ScopeSettings::parse(Bytes::from_static(b"Path = C:\\data\\run1\r\n"));
        assert_eq!(settings.get("Path"), Some("C:\\data\\run1"));
    }

    #[test]
    fn raw_is_preserved() {
        let raw = Bytes::from_static(b"\xFF\xFE binary");
        let settings = ScopeSettings::parse(raw.clone());
        assert_eq!(settings.raw(), &raw);
        assert!(settings.is_empty());
    }
}
