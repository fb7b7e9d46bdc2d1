use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;
use relay_core::{Expr, Message};
use tokio::sync::oneshot;

use super::ledger::Ledger;
use super::operator::Verdict;

/// How the joined message body is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinBody {
    Left,
    Right,
    Concat,
}

impl JoinBody {
    pub(crate) fn parse(text: &str) -> Option<Self> {
        match text {
            "left" => Some(JoinBody::Left),
            "right" => Some(JoinBody::Right),
            "concat" => Some(JoinBody::Concat),
            _ => None,
        }
    }
}

type Key = Vec<u8>;

/// Correlates messages from the pipeline's source topic (left) with
/// messages from a second topic (right) sharing the same key.
///
/// Right messages are parked until a left message with the same key
/// arrives; at most one is parked per key (a newer one replaces it) and at
/// most `capacity` overall, oldest evicted first. A left message with no
/// parked partner waits up to `timeout` for one and fails otherwise.
///
/// Parking and claiming are recorded in the ledger, so a send that fails
/// later leaves the buffer as it found it. A right message handed straight
/// to a waiting left message is not undone.
pub(crate) struct Joiner {
    key: Expr,
    right_topic: String,
    timeout: Duration,
    capacity: usize,
    body: JoinBody,
    state: Arc<Mutex<JoinState>>,
}

#[derive(Default)]
struct JoinState {
    parked: HashMap<Key, (u64, Message)>,
    parked_order: VecDeque<(u64, Key)>,
    waiters: HashMap<Key, VecDeque<(u64, oneshot::Sender<Message>)>>,
    next_id: u64,
}

impl JoinState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_parked(&mut self, key: &[u8]) -> Option<Message> {
        self.parked.remove(key).map(|(_, message)| message)
    }

    fn park(&mut self, key: Key, message: Message, capacity: usize) -> u64 {
        let id = self.next_id();
        self.parked.insert(key.clone(), (id, message));
        self.parked_order.push_back((id, key));
        while self.parked.len() > capacity {
            let Some((id, key)) = self.parked_order.pop_front() else {
                break;
            };
            if self.parked.get(&key).is_some_and(|(live, _)| *live == id) {
                self.parked.remove(&key);
            }
        }
        // entries for consumed or replaced messages are dropped lazily
        if self.parked_order.len() > capacity.saturating_mul(2) {
            let parked = &self.parked;
            self.parked_order
                .retain(|(id, key)| parked.get(key).is_some_and(|(live, _)| live == id));
        }
        id
    }

    /// Removes the parked message `id` for `key` if it is still there.
    fn unpark(&mut self, key: &[u8], id: u64) {
        if self.parked.get(key).is_some_and(|(live, _)| *live == id) {
            self.parked.remove(key);
        }
    }

    fn add_waiter(&mut self, key: Key) -> (u64, oneshot::Receiver<Message>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(key).or_default().push_back((id, tx));
        (id, rx)
    }

    fn remove_waiter(&mut self, key: &[u8], id: u64) {
        if let Some(queue) = self.waiters.get_mut(key) {
            queue.retain(|(waiter, _)| *waiter != id);
            if queue.is_empty() {
                self.waiters.remove(key);
            }
        }
    }

    /// Hands `message` to the oldest live waiter for `key`, or returns it.
    fn hand_off(&mut self, key: &[u8], mut message: Message) -> Option<Message> {
        let Some(queue) = self.waiters.get_mut(key) else {
            return Some(message);
        };
        let mut unclaimed = None;
        loop {
            let Some((_, tx)) = queue.pop_front() else {
                unclaimed = Some(message);
                break;
            };
            match tx.send(message) {
                Ok(()) => break,
                // the waiter gave up; try the next one
                Err(returned) => message = returned,
            }
        }
        if queue.is_empty() {
            self.waiters.remove(key);
        }
        unclaimed
    }
}

impl Joiner {
    pub(crate) fn new(
        key: Expr,
        right_topic: String,
        timeout: Duration,
        capacity: usize,
        body: JoinBody,
    ) -> Self {
        Self {
            key,
            right_topic,
            timeout,
            capacity,
            body,
            state: Arc::new(Mutex::new(JoinState::default())),
        }
    }

    pub(crate) fn right_topic(&self) -> &str {
        &self.right_topic
    }

    pub(crate) async fn evaluate(&self, message: Message, ledger: &mut Ledger) -> anyhow::Result<Verdict> {
        let key = self.key.eval(&message)?;
        if key.is_null() {
            bail!("correlation key `{}` is null", self.key.source());
        }
        let key = key.canonical_bytes();

        if message.topic == self.right_topic {
            let mut state = self.state.lock();
            if let Some(unclaimed) = state.hand_off(&key, message) {
                let id = state.park(key.clone(), unclaimed, self.capacity);
                let shared = Arc::clone(&self.state);
                ledger.record(move || shared.lock().unpark(&key, id));
            }
            return Ok(Verdict::Drop);
        }

        let (id, mut rx) = {
            let mut state = self.state.lock();
            match state.take_parked(&key) {
                Some(right) => {
                    let shared = Arc::clone(&self.state);
                    let (restored, capacity) = (right.clone(), self.capacity);
                    let slot = key.clone();
                    ledger.record(move || {
                        let mut state = shared.lock();
                        if !state.parked.contains_key(&slot) {
                            state.park(slot, restored, capacity);
                        }
                    });
                    return Ok(Verdict::Forward(self.merge(message, right)));
                }
                None => state.add_waiter(key.clone()),
            }
        };

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(right)) => Ok(Verdict::Forward(self.merge(message, right))),
            Ok(Err(_)) => bail!("join state for `{}` was discarded", self.right_topic),
            Err(_) => {
                self.state.lock().remove_waiter(&key, id);
                // a partner may have arrived between the deadline and the removal
                if let Ok(right) = rx.try_recv() {
                    return Ok(Verdict::Forward(self.merge(message, right)));
                }
                bail!(
                    "no correlated message on `{}` within {}ms",
                    self.right_topic,
                    self.timeout.as_millis()
                )
            }
        }
    }

    /// Left properties win on conflict.
    fn merge(&self, left: Message, right: Message) -> Message {
        let Message {
            body, properties, ..
        } = right;
        let mut merged = left;
        for (k, v) in properties {
            merged.properties.entry(k).or_insert(v);
        }
        match self.body {
            JoinBody::Left => {}
            JoinBody::Right => merged.body = body,
            JoinBody::Concat => merged.body.extend_from_slice(&body),
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    impl Joiner {
        async fn check(&self, message: Message) -> anyhow::Result<Verdict> {
            self.evaluate(message, &mut Ledger::default()).await
        }
    }

    fn joiner(capacity: usize, timeout_ms: u64, body: JoinBody) -> Joiner {
        Joiner::new(
            Expr::parse("prop.order").unwrap(),
            "payments".to_string(),
            Duration::from_millis(timeout_ms),
            capacity,
            body,
        )
    }

    fn left(order: &str, body: &str) -> Message {
        Message::new("orders", body)
            .with_property("order", order)
            .with_property("side", "left")
    }

    fn right(order: &str, body: &str) -> Message {
        Message::new("payments", body)
            .with_property("order", order)
            .with_property("side", "right")
            .with_property("paid", "yes")
    }

    #[tokio::test]
    async fn parked_right_joins_with_left() {
        let j = joiner(8, 1_000, JoinBody::Concat);
        assert_eq!(j.check(right("1", "-pay")).await.unwrap(), Verdict::Drop);
        let Verdict::Forward(out) = j.check(left("1", "order")).await.unwrap() else {
            panic!("expected join");
        };
        assert_eq!(out.body, b"order-pay");
        assert_eq!(out.topic, "orders");
        assert_eq!(out.property("side"), Some("left"));
        assert_eq!(out.property("paid"), Some("yes"));
    }

    #[tokio::test]
    async fn waiting_left_is_released_by_right() {
        let j = Arc::new(joiner(8, 5_000, JoinBody::Right));
        let waiting = {
            let j = Arc::clone(&j);
            tokio::spawn(async move { j.check(left("7", "order")).await })
        };
        tokio::task::yield_now().await;
        // spin until the waiter is registered
        while j.state.lock().waiters.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(j.check(right("7", "pay")).await.unwrap(), Verdict::Drop);
        let Verdict::Forward(out) = waiting.await.unwrap().unwrap() else {
            panic!("expected join");
        };
        assert_eq!(out.body, b"pay");
        assert!(j.state.lock().parked.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn left_without_partner_times_out() {
        let j = joiner(8, 100, JoinBody::Left);
        let err = j.check(left("9", "order")).await.unwrap_err();
        assert!(err.to_string().contains("within 100ms"));
        assert!(j.state.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn buffer_evicts_oldest_parked() {
        let j = joiner(2, 10, JoinBody::Left);
        for order in ["1", "2", "3"] {
            j.check(right(order, "")).await.unwrap();
        }
        let state = j.state.lock();
        assert_eq!(state.parked.len(), 2);
        assert!(!state.parked.contains_key(&relay_core::Value::Str("1".into()).canonical_bytes()));
    }

    #[tokio::test]
    async fn rollback_restores_the_buffer() {
        let j = joiner(8, 10, JoinBody::Left);
        let mut parking = Ledger::default();
        j.evaluate(right("1", ""), &mut parking).await.unwrap();
        assert_eq!(j.state.lock().parked.len(), 1);
        parking.rollback();
        assert!(j.state.lock().parked.is_empty());

        j.check(right("2", "pay")).await.unwrap();
        let mut claiming = Ledger::default();
        let verdict = j.evaluate(left("2", "order"), &mut claiming).await.unwrap();
        assert!(matches!(verdict, Verdict::Forward(_)));
        assert!(j.state.lock().parked.is_empty());
        claiming.rollback();
        let Verdict::Forward(out) = j.check(left("2", "again")).await.unwrap() else {
            panic!("restored partner must join");
        };
        assert_eq!(out.property("paid"), Some("yes"));
    }

    #[tokio::test]
    async fn null_key_is_an_error() {
        let j = joiner(2, 10, JoinBody::Left);
        assert!(j.check(Message::new("orders", "")).await.is_err());
    }

    #[test]
    fn join_body_parsing() {
        assert_eq!(JoinBody::parse("concat"), Some(JoinBody::Concat));
        assert_eq!(JoinBody::parse("middle"), None);
    }
}
