//! Timestamped events and their `EVT:` text form

use std::fmt;

/// Named event parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventParam {
    /// Parameter name
    pub name: String,
    /// Value, quotes removed
    pub value: String,
}

impl EventParam {
    /// New parameter
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One event of an event data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Monotonic time in microseconds
    pub timestamp: i64,
    /// Event name
    pub name: String,
    /// Parameters in emission order
    pub params: Vec<EventParam>,
}

impl Event {
    /// New event
    pub fn new(timestamp: i64, name: impl Into<String>, params: Vec<EventParam>) -> Self {
        Self {
            timestamp,
            name: name.into(),
            params,
        }
    }

    /// Parse `EVT:NAME;key=value;key='quoted value'`
    ///
    /// `EVTS:` is accepted as well. Returns `None` for other messages or when
    /// a parameter has no `=`.
    #[must_use]
    pub fn from_string(log: &str, timestamp: i64) -> Option<Self> {
        let msg = log
            .strip_prefix("EVT:")
            .or_else(|| log.strip_prefix("EVTS:"))?;

        let mut fields = msg.split(';');
        let name = fields.next()?;
        let params = fields
            .map(|field| {
                let (name, value) = field.split_once('=')?;
                let value = value
                    .strip_prefix('\'')
                    .and_then(|v| v.strip_suffix('\''))
                    .unwrap_or(value);
                Some(EventParam::new(name, value))
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self::new(timestamp, name, params))
    }

    /// Value of the first parameter called `name`
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp, self.name)?;
        for param in &self.params {
            write!(f, " {}={}", param.name, param.value)?;
        }
        Ok(())
    }
}
