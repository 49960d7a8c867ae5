//! Pub/sub message broker for channel-based messaging.
//!
//! Manages subscriptions and broadcasts messages to matching
//! subscribers. Handlers call `publish`/`subscribe`/`unsubscribe`;
//! delivery fan-out rides on tokio broadcast channels and the
//! per-connection forwarder tasks owned by the connection layer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Maximum allowed byte length for a subscription pattern. Longer
/// patterns only let clients force repeated glob work on every publish.
const MAX_PATTERN_LEN: usize = 512;

/// Buffered messages per subscription before slow consumers start
/// missing messages.
const CHANNEL_CAPACITY: usize = 256;

/// A message published to a channel.
#[derive(Debug, Clone)]
pub struct PubMessage {
    /// The channel the message was published to.
    pub channel: Arc<str>,
    /// The raw message data.
    pub data: Bytes,
    /// For pattern subscriptions, the pattern that matched.
    pub pattern: Option<Arc<str>>,
}

/// Manages pub/sub state: channel subscriptions, pattern subscriptions,
/// and message broadcasting. Shared via `Arc` across connections.
pub struct PubSubManager {
    channels: DashMap<String, broadcast::Sender<PubMessage>>,
    patterns: DashMap<String, broadcast::Sender<PubMessage>>,
    subscription_count: AtomicUsize,
}

impl PubSubManager {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            patterns: DashMap::new(),
            subscription_count: AtomicUsize::new(0),
        }
    }

    /// Subscribe to an exact channel.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<PubMessage> {
        self.subscribe_to(&self.channels, channel)
    }

    /// Unsubscribe from an exact channel. The receiver itself is
    /// dropped by the caller; this cleans up empty channel entries.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.unsubscribe_from(&self.channels, channel)
    }

    /// Subscribe to a glob pattern. `None` if the pattern is too long.
    pub fn psubscribe(&self, pattern: &str) -> Option<broadcast::Receiver<PubMessage>> {
        if pattern.len() > MAX_PATTERN_LEN {
            return None;
        }
        Some(self.subscribe_to(&self.patterns, pattern))
    }

    /// Unsubscribe from a pattern.
    pub fn punsubscribe(&self, pattern: &str) -> bool {
        self.unsubscribe_from(&self.patterns, pattern)
    }

    fn subscribe_to(
        &self,
        map: &DashMap<String, broadcast::Sender<PubMessage>>,
        key: &str,
    ) -> broadcast::Receiver<PubMessage> {
        let entry = map.entry(key.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            tx
        });
        self.subscription_count.fetch_add(1, Ordering::Relaxed);
        entry.subscribe()
    }

    fn unsubscribe_from(
        &self,
        map: &DashMap<String, broadcast::Sender<PubMessage>>,
        key: &str,
    ) -> bool {
        if let Some(entry) = map.get(key) {
            self.subscription_count.fetch_sub(1, Ordering::Relaxed);
            if entry.receiver_count() <= 1 {
                drop(entry);
                map.remove(key);
            }
            true
        } else {
            false
        }
    }

    /// Publish a message to a channel. Returns how many subscribers
    /// received it (exact + pattern).
    pub fn publish(&self, channel: &str, data: Bytes) -> usize {
        let mut count = 0;
        let channel_arc: Arc<str> = Arc::from(channel);

        if let Some(tx) = self.channels.get(channel) {
            let msg = PubMessage {
                channel: Arc::clone(&channel_arc),
                data: data.clone(),
                pattern: None,
            };
            count += tx.send(msg).unwrap_or(0);
        }

        for entry in self.patterns.iter() {
            let pattern = entry.key();
            if glob_match(pattern, channel) {
                let msg = PubMessage {
                    channel: Arc::clone(&channel_arc),
                    data: data.clone(),
                    pattern: Some(Arc::from(pattern.as_str())),
                };
                count += entry.value().send(msg).unwrap_or(0);
            }
        }
        count
    }

    /// Active channel names, optionally filtered by a glob pattern.
    /// Used by PUBSUB CHANNELS.
    pub fn channel_names(&self, pattern: Option<&str>) -> Vec<String> {
        self.channels
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| match pattern {
                Some(pat) => glob_match(pat, name),
                None => true,
            })
            .collect()
    }

    /// Total active subscriptions (channels + patterns).
    pub fn total_subscriptions(&self) -> usize {
        self.subscription_count.load(Ordering::Relaxed)
    }
}

impl Default for PubSubManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Glob matching for patterns: `*`, `?`, and `[abc]` classes, with an
/// iterative two-pointer scan and star backtracking.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    let mut pi = 0;
    let mut ti = 0;
    let mut star_pi: Option<usize> = None;
    let mut star_ti: usize = 0;

    while ti < txt.len() || pi < pat.len() {
        if pi < pat.len() {
            match pat[pi] {
                '*' => {
                    star_pi = Some(pi);
                    star_ti = ti;
                    pi += 1;
                    continue;
                }
                '?' if ti < txt.len() => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' if ti < txt.len() => {
                    let tc = txt[ti];
                    let mut j = pi + 1;
                    let mut negated = false;
                    let mut matched = false;

                    if j < pat.len() && (pat[j] == '^' || pat[j] == '!') {
                        negated = true;
                        j += 1;
                    }
                    while j < pat.len() && pat[j] != ']' {
                        if pat[j] == tc {
                            matched = true;
                        }
                        j += 1;
                    }
                    if negated {
                        matched = !matched;
                    }
                    if matched && j < pat.len() {
                        pi = j + 1;
                        ti += 1;
                        continue;
                    }
                }
                c if ti < txt.len() && c == txt[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }

        if let Some(sp) = star_pi {
            pi = sp + 1;
            star_ti += 1;
            ti = star_ti;
            if ti > txt.len() {
                return false;
            }
        } else {
            return false;
        }
    }

    while pi < pat.len() && pat[pi] == '*' {
        pi += 1;
    }
    pi == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let ps = PubSubManager::new();
        let mut rx = ps.subscribe("news");

        let delivered = ps.publish("news", Bytes::from("hello"));
        assert_eq!(delivered, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg.channel, "news");
        assert_eq!(msg.data, Bytes::from("hello"));
        assert!(msg.pattern.is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_delivers_nothing() {
        let ps = PubSubManager::new();
        assert_eq!(ps.publish("empty", Bytes::from("x")), 0);
    }

    #[tokio::test]
    async fn pattern_subscription_matches() {
        let ps = PubSubManager::new();
        let mut rx = ps.psubscribe("news.*").unwrap();

        assert_eq!(ps.publish("news.sports", Bytes::from("goal")), 1);
        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg.channel, "news.sports");
        assert_eq!(msg.pattern.as_deref(), Some("news.*"));

        assert_eq!(ps.publish("weather", Bytes::from("rain")), 0);
    }

    #[tokio::test]
    async fn unsubscribe_cleans_up() {
        let ps = PubSubManager::new();
        let rx = ps.subscribe("c");
        assert_eq!(ps.total_subscriptions(), 1);

        drop(rx);
        assert!(ps.unsubscribe("c"));
        assert_eq!(ps.total_subscriptions(), 0);
        assert!(!ps.unsubscribe("c"));
    }

    #[tokio::test]
    async fn channel_names_filterable() {
        let ps = PubSubManager::new();
        let _a = ps.subscribe("user:1");
        let _b = ps.subscribe("user:2");
        let _c = ps.subscribe("system");

        let mut all = ps.channel_names(None);
        all.sort();
        assert_eq!(all, vec!["system", "user:1", "user:2"]);

        let mut users = ps.channel_names(Some("user:*"));
        users.sort();
        assert_eq!(users, vec!["user:1", "user:2"]);
    }

    #[test]
    fn oversized_pattern_rejected() {
        let ps = PubSubManager::new();
        let long = "x".repeat(MAX_PATTERN_LEN + 1);
        assert!(ps.psubscribe(&long).is_none());
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match("user:*", "user:123"));
        assert!(glob_match("key?", "key1"));
        assert!(!glob_match("key?", "key"));
        assert!(glob_match("key[abc]", "keyb"));
        assert!(!glob_match("key[abc]", "keyd"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "nope"));
    }
}
