// Subscriber tables: exact event names and compiled patterns.
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use regex::Regex;

use crate::connection::ConnectionId;

/// A subscription specifier containing any regex metacharacter is treated as
/// a pattern. Plain dots are allowed in literal names so that dotted event
/// names like `log.new_service` subscribe exactly.
pub(crate) fn is_pattern(event: &str) -> bool {
    event.chars().any(|c| {
        matches!(
            c,
            '\\' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|'
        )
    })
}

struct PatternSubscribers {
    regex: Regex,
    subscribers: Vec<ConnectionId>,
}

/// Two tables keyed by the literal specifier string. A connection may appear
/// several times under one key; each entry receives one delivery.
pub(crate) struct SubscriberTables {
    exact: HashMap<String, Vec<ConnectionId>>,
    patterns: HashMap<String, PatternSubscribers>,
}

impl SubscriberTables {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            patterns: HashMap::new(),
        }
    }

    pub fn add_exact(&mut self, event: &str, conn: ConnectionId) {
        self.exact.entry(event.to_string()).or_default().push(conn);
    }

    /// Compile and insert a pattern subscription. The pattern is compiled
    /// once per specifier string; later subscribers reuse it.
    pub fn add_pattern(&mut self, pattern: &str, conn: ConnectionId) -> Result<(), regex::Error> {
        match self.patterns.entry(pattern.to_string()) {
            Entry::Occupied(mut entry) => entry.get_mut().subscribers.push(conn),
            Entry::Vacant(entry) => {
                let regex = Regex::new(pattern)?;
                entry.insert(PatternSubscribers {
                    regex,
                    subscribers: vec![conn],
                });
            }
        }
        Ok(())
    }

    /// All connections subscribed to `event`, duplicates preserved: exact
    /// entries first, then every pattern whose regex matches.
    pub fn matching(&self, event: &str) -> Vec<ConnectionId> {
        let mut matched = Vec::new();
        if let Some(subscribers) = self.exact.get(event) {
            matched.extend_from_slice(subscribers);
        }
        for entry in self.patterns.values() {
            if entry.regex.is_match(event) {
                matched.extend_from_slice(&entry.subscribers);
            }
        }
        matched
    }

    /// Remove every entry pointing at `conn` from both tables. Returns one
    /// specifier string per removed entry, for lost-subscriber publication.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> Vec<String> {
        let mut removed = Vec::new();
        self.exact.retain(|event, subscribers| {
            subscribers.retain(|subscriber| {
                let keep = *subscriber != conn;
                if !keep {
                    removed.push(event.clone());
                }
                keep
            });
            !subscribers.is_empty()
        });
        self.patterns.retain(|pattern, entry| {
            entry.subscribers.retain(|subscriber| {
                let keep = *subscriber != conn;
                if !keep {
                    removed.push(pattern.clone());
                }
                keep
            });
            !entry.subscribers.is_empty()
        });
        removed
    }

    /// Specifier-to-subscribers view over both tables, for introspection.
    pub fn snapshot(&self) -> Vec<(String, Vec<ConnectionId>)> {
        let exact = self
            .exact
            .iter()
            .map(|(event, subscribers)| (event.clone(), subscribers.clone()));
        let patterns = self
            .patterns
            .iter()
            .map(|(pattern, entry)| (pattern.clone(), entry.subscribers.clone()));
        exact.chain(patterns).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_event_names_are_literal() {
        assert!(!is_pattern("log.new_service"));
        assert!(!is_pattern("beacon"));
        assert!(is_pattern(r"log\.new_.*"));
        assert!(is_pattern("match|beacon"));
        assert!(is_pattern("^robot"));
    }

    #[test]
    fn exact_match_only_hits_the_literal_name() {
        let mut tables = SubscriberTables::new();
        tables.add_exact("match.start", ConnectionId(1));
        assert_eq!(tables.matching("match.start"), vec![ConnectionId(1)]);
        assert!(tables.matching("match.stop").is_empty());
    }

    #[test]
    fn pattern_matches_are_unanchored() {
        let mut tables = SubscriberTables::new();
        tables
            .add_pattern(r"log\.new_.*", ConnectionId(2))
            .expect("pattern");
        assert_eq!(tables.matching("log.new_service"), vec![ConnectionId(2)]);
        assert!(tables.matching("log.lost_service").is_empty());
    }

    #[test]
    fn duplicate_subscriptions_deliver_twice() {
        let mut tables = SubscriberTables::new();
        tables.add_exact("beacon", ConnectionId(3));
        tables.add_exact("beacon", ConnectionId(3));
        assert_eq!(
            tables.matching("beacon"),
            vec![ConnectionId(3), ConnectionId(3)]
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut tables = SubscriberTables::new();
        assert!(tables.add_pattern("robot(", ConnectionId(4)).is_err());
        assert!(tables.matching("robot").is_empty());
    }

    #[test]
    fn remove_connection_purges_both_tables() {
        let mut tables = SubscriberTables::new();
        tables.add_exact("beacon", ConnectionId(1));
        tables.add_exact("beacon", ConnectionId(2));
        tables
            .add_pattern(r"log\..*", ConnectionId(1))
            .expect("pattern");

        let mut removed = tables.remove_connection(ConnectionId(1));
        removed.sort();
        assert_eq!(removed, vec!["beacon".to_string(), r"log\..*".to_string()]);
        assert_eq!(tables.matching("beacon"), vec![ConnectionId(2)]);
        assert!(tables.matching("log.new_service").is_empty());
    }

    #[test]
    fn empty_keys_are_dropped_after_removal() {
        let mut tables = SubscriberTables::new();
        tables.add_exact("beacon", ConnectionId(1));
        tables.remove_connection(ConnectionId(1));
        assert!(tables.snapshot().is_empty());
    }
}
