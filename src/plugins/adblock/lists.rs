//! Host lists for the ad blocker.
//!
//! Lists are exact-match sets of host names. They only ever grow: entries are
//! merged in from configuration and remote list bodies, never removed.

use std::sync::RwLock;

use rustc_hash::FxHashSet;

/// An insert-only set of host names behind its own lock.
#[derive(Default)]
pub struct HostSet {
    hosts: RwLock<FxHashSet<String>>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact-match lookup.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts
            .read()
            .map(|hosts| hosts.contains(host))
            .unwrap_or(false)
    }

    /// Insert every entry under a single lock acquisition.
    pub fn extend<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.extend(entries.into_iter().map(Into::into));
        }
    }

    /// Merge a fetched list body; returns how many lines were accepted.
    pub fn merge_body(&self, body: &str) -> usize {
        let entries: Vec<&str> = parse_lines(body).collect();
        let accepted = entries.len();
        self.extend(entries);
        accepted
    }

    pub fn len(&self) -> usize {
        self.hosts.read().map(|hosts| hosts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entries of a list body: blank lines and lines starting with `#` or `;`
/// are skipped, everything else is kept verbatim.
pub fn parse_lines(body: &str) -> impl Iterator<Item = &str> {
    body.lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lines_skips_blanks_and_comments() {
        let body = "# header\nads.example\n\n; note\ntracker.example\r\n";

        let entries: Vec<_> = parse_lines(body).collect();

        assert_eq!(entries, ["ads.example", "tracker.example"]);
    }

    #[test]
    fn parse_lines_keeps_entries_verbatim() {
        let entries: Vec<_> = parse_lines("0.0.0.0 ads.example\n  spaced.example").collect();

        assert_eq!(entries, ["0.0.0.0 ads.example", "  spaced.example"]);
    }

    #[test]
    fn contains_is_exact_match() {
        let set = HostSet::new();
        set.extend(["doubleclick.com"]);

        assert!(set.contains("doubleclick.com"));
        assert!(!set.contains("ads.doubleclick.com"));
        assert!(!set.contains("DOUBLECLICK.COM"));
    }

    #[test]
    fn merge_body_counts_accepted_lines_and_deduplicates() {
        let set = HostSet::new();
        set.extend(["a.example"]);

        let accepted = set.merge_body("a.example\nb.example\n# c.example\n");

        assert_eq!(accepted, 2);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn empty_set_contains_nothing() {
        let set = HostSet::new();

        assert!(set.is_empty());
        assert!(!set.contains(""));
    }
}
