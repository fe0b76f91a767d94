//! Broker topology as data.
//!
//! A [`Topology`] lists the exchanges, queues and bindings a service needs
//! before any message can flow. Adapters turn it into declare calls; the
//! in-memory broker uses it to route.

use serde::{Deserialize, Serialize};

/// Routing key of order events.
pub const ORDER_CREATED_KEY: &str = "order.created";
/// Routing key of successful reservations.
pub const STOCK_RESERVED_KEY: &str = "stock.reserved";
/// Routing key of rejected reservations.
pub const STOCK_REJECTED_KEY: &str = "stock.rejected";

/// Exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// Pattern-matched routing keys (`*` one word, `#` zero or more words)
    Topic,
    /// Exact routing key match
    Direct,
}

/// An exchange to declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    /// Exchange name
    pub name: String,
    /// Exchange type
    pub kind: ExchangeKind,
    /// Survives broker restarts
    pub durable: bool,
}

/// A queue to declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survives broker restarts
    pub durable: bool,
}

/// A queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    /// Bound queue
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Binding pattern
    pub routing_key: String,
}

/// Names of the exchanges and queues shared by both services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerNames {
    /// Exchange order events are published to
    pub order_exchange: String,
    /// Queue the inventory service consumes order events from
    pub order_queue: String,
    /// Routing key order events are published and bound with
    pub order_created_key: String,
    /// Exchange reservation outcomes are published to
    pub response_exchange: String,
    /// Queue the order service consumes outcomes from
    pub response_queue: String,
}

impl Default for BrokerNames {
    fn default() -> Self {
        Self {
            order_exchange: "order.exchange".to_string(),
            order_queue: "order.queue".to_string(),
            order_created_key: ORDER_CREATED_KEY.to_string(),
            response_exchange: "inventory.response.exchange".to_string(),
            response_queue: "order.inventory.response.queue".to_string(),
        }
    }
}

/// Exchanges, queues and bindings for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Exchanges, declared first
    pub exchanges: Vec<ExchangeSpec>,
    /// Queues, declared after exchanges
    pub queues: Vec<QueueSpec>,
    /// Bindings, declared last
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// Start from an empty topology.
    #[must_use]
    pub fn builder() -> Self {
        Self::default()
    }

    /// Add a durable topic exchange.
    #[must_use]
    pub fn topic_exchange(mut self, name: impl Into<String>) -> Self {
        self.exchanges.push(ExchangeSpec {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        });
        self
    }

    /// Add a durable queue.
    #[must_use]
    pub fn durable_queue(mut self, name: impl Into<String>) -> Self {
        self.queues.push(QueueSpec {
            name: name.into(),
            durable: true,
        });
        self
    }

    /// Bind a queue to an exchange.
    #[must_use]
    pub fn bind(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.bindings.push(BindingSpec {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }

    /// Topology of the inventory service.
    ///
    /// Both exchanges plus the order queue bound on the order-created key.
    #[must_use]
    pub fn inventory(names: &BrokerNames) -> Self {
        Self::builder()
            .topic_exchange(&names.order_exchange)
            .topic_exchange(&names.response_exchange)
            .durable_queue(&names.order_queue)
            .bind(&names.order_queue, &names.order_exchange, &names.order_created_key)
    }

    /// Topology of the order service.
    ///
    /// Both exchanges plus the response queue bound on both outcome keys.
    #[must_use]
    pub fn order_side(names: &BrokerNames) -> Self {
        Self::builder()
            .topic_exchange(&names.order_exchange)
            .topic_exchange(&names.response_exchange)
            .durable_queue(&names.response_queue)
            .bind(&names.response_queue, &names.response_exchange, STOCK_RESERVED_KEY)
            .bind(&names.response_queue, &names.response_exchange, STOCK_REJECTED_KEY)
    }

    /// Merge two topologies, dropping duplicates.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        for exchange in other.exchanges {
            if !self.exchanges.contains(&exchange) {
                self.exchanges.push(exchange);
            }
        }
        for queue in other.queues {
            if !self.queues.contains(&queue) {
                self.queues.push(queue);
            }
        }
        for binding in other.bindings {
            if !self.bindings.contains(&binding) {
                self.bindings.push(binding);
            }
        }
        self
    }
}

/// Whether a topic-exchange binding pattern matches a routing key.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            matches_words(rest, key) || (!key.is_empty() && matches_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => matches_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && matches_words(rest, key_rest)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_topology_declares_durable_topic_exchanges() {
        let topology = Topology::inventory(&BrokerNames::default());

        assert_eq!(topology.exchanges.len(), 2);
        assert!(
            topology
                .exchanges
                .iter()
                .all(|e| e.durable && e.kind == ExchangeKind::Topic)
        );
        assert_eq!(
            topology.queues,
            vec![QueueSpec {
                name: "order.queue".into(),
                durable: true
            }]
        );
        assert_eq!(
            topology.bindings,
            vec![BindingSpec {
                queue: "order.queue".into(),
                exchange: "order.exchange".into(),
                routing_key: "order.created".into(),
            }]
        );
    }

    #[test]
    fn merged_topologies_do_not_duplicate_exchanges() {
        let names = BrokerNames::default();
        let merged = Topology::inventory(&names).merge(Topology::order_side(&names));
        assert_eq!(merged.exchanges.len(), 2);
        assert_eq!(merged.queues.len(), 2);
        assert_eq!(merged.bindings.len(), 3);
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(!topic_matches("order.created", "order.cancelled"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.v2"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("order.#", "order.created.v2"));
        assert!(topic_matches("#", "stock.rejected"));
        assert!(topic_matches("*.rejected", "stock.rejected"));
    }
}
