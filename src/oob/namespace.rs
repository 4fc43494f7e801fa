//! Deterministic per-round store keys

/// Key set used by one rendezvous round
///
/// Keys are `<prefix>/teamr<rank>` (published data), `<prefix>/ag_done`
/// (shared completion counter) and `<prefix>/ag_free<rank>` (release
/// signal). An empty prefix yields the bare key names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Namespace scoped to one round identifier under a base prefix
    pub fn for_round(base: &str, round_id: &str) -> Self {
        if base.is_empty() {
            Self::new(round_id)
        } else {
            Self::new(format!("{}/{}", base, round_id))
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Key holding `rank`'s published bytes
    pub fn publish_key(&self, rank: usize) -> String {
        self.key(&format!("teamr{}", rank))
    }

    /// Shared completion counter
    pub fn done_key(&self) -> String {
        self.key("ag_done")
    }

    /// Key signalling `rank` that it may leave the barrier
    pub fn release_key(&self, rank: usize) -> String {
        self.key(&format!("ag_free{}", rank))
    }

    /// Publish keys of every rank, ascending
    pub fn publish_keys(&self, size: usize) -> Vec<String> {
        (0..size).map(|r| self.publish_key(r)).collect()
    }

    /// Every key a round of `size` peers can create
    pub fn all_keys(&self, size: usize) -> Vec<String> {
        let mut keys = self.publish_keys(size);
        keys.push(self.done_key());
        keys.extend((0..size).map(|r| self.release_key(r)));
        keys
    }
}
