use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

/// Opaque posting identifier taken from a listing link. Case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One row: field name → value, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct JobRecord {
    fields: IndexMap<String, String>,
}

impl JobRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. A name seen before keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Make `field` hold `key` and sit in the first position.
    ///
    /// Returns the previous value when it was present and different.
    pub fn pin_key(&mut self, field: &str, key: &JobKey) -> Option<String> {
        let previous = self
            .fields
            .insert(field.to_string(), key.as_str().to_string())
            .filter(|old| old != key.as_str());
        if let Some(idx) = self.fields.get_index_of(field) {
            self.fields.move_index(idx, 0);
        }
        previous
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = JobRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_first_position() {
        let mut r = JobRecord::new();
        r.insert("A", "1");
        r.insert("B", "2");
        r.insert("A", "3");
        assert_eq!(r.names().collect::<Vec<_>>(), ["A", "B"]);
        assert_eq!(r.get("A"), Some("3"));
    }

    #[test]
    fn pin_key_moves_field_first() {
        let mut r: JobRecord = [("Title", "SE"), ("Job Key No", "77")].into_iter().collect();
        let prev = r.pin_key("Job Key No", &JobKey::from("77"));
        assert_eq!(prev, None);
        assert_eq!(r.names().collect::<Vec<_>>(), ["Job Key No", "Title"]);
    }

    #[test]
    fn pin_key_inserts_missing_and_reports_mismatch() {
        let mut r: JobRecord = [("Title", "SE")].into_iter().collect();
        assert_eq!(r.pin_key("Job Key No", &JobKey::from("9")), None);
        assert_eq!(r.iter().next(), Some(("Job Key No", "9")));

        let mut r: JobRecord = [("Job Key No", "8")].into_iter().collect();
        assert_eq!(r.pin_key("Job Key No", &JobKey::from("9")).as_deref(), Some("8"));
        assert_eq!(r.get("Job Key No"), Some("9"));
    }
}
