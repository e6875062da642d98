use crate::glob::glob_match;
use crate::resp::RespValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// A message delivered to a subscriber. `pattern` is set when the delivery
/// happened through a pattern subscription (a `pmessage` push).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub channel: String,
    pub pattern: Option<String>,
    pub payload: Vec<u8>,
}

impl PushMessage {
    /// The server-push frame for this delivery: `message` for channel
    /// subscriptions, `pmessage` for pattern subscriptions.
    pub fn frame(&self) -> RespValue {
        match &self.pattern {
            Some(pattern) => RespValue::array(vec![
                RespValue::bulk("pmessage"),
                RespValue::bulk(pattern.as_bytes()),
                RespValue::bulk(self.channel.as_bytes()),
                RespValue::bulk(self.payload.clone()),
            ]),
            None => RespValue::array(vec![
                RespValue::bulk("message"),
                RespValue::bulk(self.channel.as_bytes()),
                RespValue::bulk(self.payload.clone()),
            ]),
        }
    }
}

/// What travels down a subscriber's queue: published messages, or
/// pre-rendered frames (extra (un)subscribe confirmations that must reach
/// the wire in order).
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    Message(PushMessage),
    Frame(RespValue),
}

impl Push {
    pub fn frame(&self) -> RespValue {
        match self {
            Push::Message(m) => m.frame(),
            Push::Frame(f) => f.clone(),
        }
    }
}

pub type PushSender = mpsc::UnboundedSender<Push>;
pub type PushReceiver = mpsc::UnboundedReceiver<Push>;

#[derive(Debug)]
struct SubscriberEntry {
    channels: HashSet<String>,
    patterns: HashSet<String>,
    tx: PushSender,
}

/// The subscriber registry. Peer-owned subscribers are registered on their
/// first (P)SUBSCRIBE and removed when their last subscription drops or the
/// peer disconnects; standalone harness subscribers stay registered until
/// closed explicitly.
#[derive(Debug, Default)]
pub struct PubSubRegistry {
    next_id: u64,
    subscribers: HashMap<u64, SubscriberEntry>,
}

impl PubSubRegistry {
    pub fn new() -> Self {
        PubSubRegistry::default()
    }

    /// Register a subscriber with its push queue; returns its id.
    pub fn add(&mut self, tx: PushSender) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(
            id,
            SubscriberEntry {
                channels: HashSet::new(),
                patterns: HashSet::new(),
                tx,
            },
        );
        id
    }

    /// Drop a subscriber entirely, closing its queue.
    pub fn remove(&mut self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Subscribe to a channel; returns the subscriber's total subscription
    /// count.
    pub fn subscribe(&mut self, id: u64, channel: &str) -> usize {
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.channels.insert(channel.to_string());
        }
        self.subscription_count(id)
    }

    pub fn unsubscribe(&mut self, id: u64, channel: &str) -> usize {
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.channels.remove(channel);
        }
        self.subscription_count(id)
    }

    /// Subscribe to a glob pattern; returns the total subscription count.
    pub fn psubscribe(&mut self, id: u64, pattern: &str) -> usize {
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.patterns.insert(pattern.to_string());
        }
        self.subscription_count(id)
    }

    pub fn punsubscribe(&mut self, id: u64, pattern: &str) -> usize {
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.patterns.remove(pattern);
        }
        self.subscription_count(id)
    }

    pub fn subscription_count(&self, id: u64) -> usize {
        self.subscribers
            .get(&id)
            .map_or(0, |s| s.channels.len() + s.patterns.len())
    }

    pub fn channel_list(&self, id: u64) -> Vec<String> {
        let mut out: Vec<String> = self
            .subscribers
            .get(&id)
            .map(|s| s.channels.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn pattern_list(&self, id: u64) -> Vec<String> {
        let mut out: Vec<String> = self
            .subscribers
            .get(&id)
            .map(|s| s.patterns.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Fan a message out to every subscriber. Each matching channel
    /// subscription and each matching pattern subscription counts as one
    /// delivery, so a subscriber listening both ways receives the message
    /// twice.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for sub in self.subscribers.values() {
            if sub.channels.contains(channel) {
                let msg = PushMessage {
                    channel: channel.to_string(),
                    pattern: None,
                    payload: payload.to_vec(),
                };
                if sub.tx.send(Push::Message(msg)).is_ok() {
                    delivered += 1;
                }
            }
            for pattern in &sub.patterns {
                if glob_match(pattern, channel) {
                    let msg = PushMessage {
                        channel: channel.to_string(),
                        pattern: Some(pattern.clone()),
                        payload: payload.to_vec(),
                    };
                    if sub.tx.send(Push::Message(msg)).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Channels with at least one subscriber, optionally filtered by
    /// pattern (PUBSUB CHANNELS).
    pub fn active_channels(&self, pattern: Option<&str>) -> Vec<String> {
        let mut channels: Vec<String> = self
            .subscribers
            .values()
            .flat_map(|s| s.channels.iter().cloned())
            .filter(|c| pattern.is_none_or(|p| glob_match(p, c)))
            .collect();
        channels.sort();
        channels.dedup();
        channels
    }

    /// Subscriber counts per channel (PUBSUB NUMSUB).
    pub fn numsub(&self, channels: &[String]) -> Vec<(String, usize)> {
        channels
            .iter()
            .map(|c| {
                let n = self
                    .subscribers
                    .values()
                    .filter(|s| s.channels.contains(c))
                    .count();
                (c.clone(), n)
            })
            .collect()
    }

    /// Total number of pattern subscriptions (PUBSUB NUMPAT).
    pub fn numpat(&self) -> usize {
        self.subscribers.values().map(|s| s.patterns.len()).sum()
    }
}

pub type SharedPubSub = Arc<RwLock<PubSubRegistry>>;

/// A standalone subscriber for observing published messages directly from a
/// test, without a client connection. It stays registered even with no
/// subscriptions; call `close` to deregister.
#[derive(Debug)]
pub struct Subscriber {
    id: u64,
    registry: SharedPubSub,
    rx: PushReceiver,
}

impl Subscriber {
    pub(crate) async fn register(registry: SharedPubSub) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.write().await.add(tx);
        Subscriber { id, registry, rx }
    }

    pub async fn subscribe(&self, channel: &str) {
        self.registry.write().await.subscribe(self.id, channel);
    }

    pub async fn unsubscribe(&self, channel: &str) {
        self.registry.write().await.unsubscribe(self.id, channel);
    }

    pub async fn psubscribe(&self, pattern: &str) {
        self.registry.write().await.psubscribe(self.id, pattern);
    }

    pub async fn punsubscribe(&self, pattern: &str) {
        self.registry.write().await.punsubscribe(self.id, pattern);
    }

    /// Next delivered message; None once the subscriber is closed and the
    /// queue drained.
    pub async fn next_message(&mut self) -> Option<PushMessage> {
        loop {
            match self.rx.recv().await? {
                Push::Message(msg) => return Some(msg),
                Push::Frame(_) => continue,
            }
        }
    }

    /// A delivered message if one is already queued.
    pub fn try_message(&mut self) -> Option<PushMessage> {
        while let Ok(push) = self.rx.try_recv() {
            if let Push::Message(msg) = push {
                return Some(msg);
            }
        }
        None
    }

    /// Deregister from the server. Pending messages can still be drained.
    pub async fn close(mut self) -> Vec<PushMessage> {
        self.registry.write().await.remove(self.id);
        let mut pending = Vec::new();
        while let Ok(push) = self.rx.try_recv() {
            if let Push::Message(msg) = push {
                pending.push(msg);
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(reg: &mut PubSubRegistry) -> (u64, PushReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (reg.add(tx), rx)
    }

    fn msg(rx: &mut PushReceiver) -> PushMessage {
        match rx.try_recv().unwrap() {
            Push::Message(m) => m,
            Push::Frame(f) => panic!("expected message, got frame {f:?}"),
        }
    }

    #[test]
    fn publish_counts_channel_deliveries() {
        let mut reg = PubSubRegistry::new();
        let (a, mut rx_a) = subscriber(&mut reg);
        let (b, mut rx_b) = subscriber(&mut reg);
        reg.subscribe(a, "chan");
        reg.subscribe(b, "chan");

        assert_eq!(reg.publish("chan", b"hello"), 2);
        assert_eq!(msg(&mut rx_a).payload, b"hello");
        assert_eq!(msg(&mut rx_b).channel, "chan");
    }

    #[test]
    fn pattern_subscription_delivers_pmessage() {
        let mut reg = PubSubRegistry::new();
        let (id, mut rx) = subscriber(&mut reg);
        reg.psubscribe(id, "news.*");

        assert_eq!(reg.publish("news.tech", b"x"), 1);
        let got = msg(&mut rx);
        assert_eq!(got.pattern.as_deref(), Some("news.*"));
        assert_eq!(got.channel, "news.tech");
        assert_eq!(reg.publish("sports", b"y"), 0);
    }

    #[test]
    fn double_subscription_is_delivered_twice() {
        let mut reg = PubSubRegistry::new();
        let (id, mut rx) = subscriber(&mut reg);
        reg.subscribe(id, "c");
        reg.psubscribe(id, "c*");

        assert_eq!(reg.publish("c", b"x"), 2);
        assert!(msg(&mut rx).pattern.is_none());
        assert!(msg(&mut rx).pattern.is_some());
    }

    #[test]
    fn subscription_counts_and_removal() {
        let mut reg = PubSubRegistry::new();
        let (id, _rx) = subscriber(&mut reg);
        assert_eq!(reg.subscribe(id, "a"), 1);
        assert_eq!(reg.psubscribe(id, "b*"), 2);
        assert_eq!(reg.unsubscribe(id, "a"), 1);
        reg.remove(id);
        assert_eq!(reg.publish("a", b"x"), 0);
    }

    #[test]
    fn introspection_lists() {
        let mut reg = PubSubRegistry::new();
        let (a, _rx_a) = subscriber(&mut reg);
        let (b, _rx_b) = subscriber(&mut reg);
        reg.subscribe(a, "zebra");
        reg.subscribe(a, "ant");
        reg.subscribe(b, "ant");
        reg.psubscribe(b, "z*");

        assert_eq!(reg.active_channels(None), vec!["ant", "zebra"]);
        assert_eq!(reg.active_channels(Some("a*")), vec!["ant"]);
        assert_eq!(
            reg.numsub(&["ant".to_string(), "nope".to_string()]),
            vec![("ant".to_string(), 2), ("nope".to_string(), 0)]
        );
        assert_eq!(reg.numpat(), 1);
        assert_eq!(reg.channel_list(a), vec!["ant", "zebra"]);
        assert_eq!(reg.pattern_list(b), vec!["z*"]);
    }

    #[test]
    fn message_frames() {
        let m = PushMessage {
            channel: "c".into(),
            pattern: None,
            payload: b"hi".to_vec(),
        };
        assert_eq!(m.frame().serialize(), b"*3\r\n$7\r\nmessage\r\n$1\r\nc\r\n$2\r\nhi\r\n");
        let p = PushMessage {
            channel: "c".into(),
            pattern: Some("c*".into()),
            payload: b"hi".to_vec(),
        };
        assert_eq!(
            p.frame().serialize(),
            b"*4\r\n$8\r\npmessage\r\n$2\r\nc*\r\n$1\r\nc\r\n$2\r\nhi\r\n"
        );
    }
}
