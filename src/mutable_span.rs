//! The mutable state accumulated by an in-flight span.

/// The role a span plays in an RPC or messaging exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Client,
    Server,
    Producer,
    Consumer,
}

/// Fields recorded on a span between start and finish, handed to the
/// [`Reporter`](crate::reporter::Reporter) as-is.
///
/// Timestamps are epoch micros; zero means unset. Tags are last-write-wins
/// by key; annotations keep every occurrence in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutableSpan {
    pub name: Option<String>,
    pub kind: Option<Kind>,
    pub start_timestamp: u64,
    pub finish_timestamp: u64,
    pub tags: Vec<(String, String)>,
    pub annotations: Vec<(u64, String)>,
    pub error: Option<String>,
    pub remote_service_name: Option<String>,
}

impl MutableSpan {
    pub(crate) fn new() -> Self {
        MutableSpan::default()
    }

    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.tags.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.tags.push((key, value));
        }
    }

    pub fn annotate(&mut self, timestamp_micros: u64, value: impl Into<String>) {
        self.annotations.push((timestamp_micros, value.into()));
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}
