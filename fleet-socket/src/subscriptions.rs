//! Reference-counted topic subscriptions.
//!
//! Several services may declare interest in the same topic; the topic stays
//! active until the last of them releases it. The active set is what goes out
//! in every `subscribe` frame, including after a reconnect.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub topic: String,
    pub active: bool,
    pub holders: usize,
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    topics: BTreeMap<String, usize>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subs = Self::new();
        for topic in topics {
            subs.acquire(topic);
        }
        subs
    }

    /// Returns true when the topic became active.
    pub fn acquire(&mut self, topic: impl Into<String>) -> bool {
        let count = self.topics.entry(topic.into()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the topic became inactive.
    pub fn release(&mut self, topic: &str) -> bool {
        match self.topics.get_mut(topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.topics.remove(topic);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Active topics in sorted order.
    pub fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<Subscription> {
        self.topics
            .iter()
            .map(|(topic, holders)| Subscription {
                topic: topic.clone(),
                active: *holders > 0,
                holders: *holders,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcounting() {
        let mut subs = Subscriptions::new();
        assert!(subs.acquire("vehicles"));
        assert!(!subs.acquire("vehicles"));
        assert!(subs.acquire("alerts"));
        assert_eq!(subs.topics(), vec!["alerts", "vehicles"]);

        assert!(!subs.release("vehicles"));
        assert!(subs.contains("vehicles"));
        assert!(subs.release("vehicles"));
        assert!(!subs.contains("vehicles"));
        assert!(!subs.release("vehicles"));
        assert_eq!(subs.topics(), vec!["alerts"]);
    }

    #[test]
    fn test_with_topics_and_list() {
        let subs = Subscriptions::with_topics(["trips", "trips", "alerts"]);
        let list = subs.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].topic, "trips");
        assert_eq!(list[1].holders, 2);
        assert!(list.iter().all(|s| s.active));
    }
}
