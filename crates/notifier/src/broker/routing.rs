use std::collections::HashMap;

use super::BrokerError;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Deliver to queues bound with exactly the message's routing key.
    Direct,
    /// Deliver to every bound queue, ignoring the routing key.
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDecl {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeDecl {
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDecl {
    pub name: String,
    pub durable: bool,
    /// Exchange that receives rejected and overflowed messages.
    pub dead_letter_exchange: Option<String>,
    /// Ready messages kept before the oldest is dropped.
    pub max_length: Option<usize>,
}

impl QueueDecl {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
            max_length: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

/// Declared exchanges, queues and bindings. Shared by both broker backends.
#[derive(Debug, Default)]
pub(super) struct RoutingTable {
    exchanges: HashMap<String, ExchangeDecl>,
    queues: HashMap<String, QueueDecl>,
    bindings: Vec<Binding>,
}

impl RoutingTable {
    pub fn declare_exchange(&mut self, decl: &ExchangeDecl) -> Result<(), BrokerError> {
        match self.exchanges.get(&decl.name) {
            Some(existing) if existing != decl => {
                Err(BrokerError::PreconditionFailed(decl.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(decl.name.clone(), decl.clone());
                Ok(())
            }
        }
    }

    /// Returns `true` if the queue is new.
    pub fn declare_queue(&mut self, decl: &QueueDecl) -> Result<bool, BrokerError> {
        match self.queues.get(&decl.name) {
            Some(existing) if existing != decl => {
                Err(BrokerError::PreconditionFailed(decl.name.clone()))
            }
            Some(_) => Ok(false),
            None => {
                self.queues.insert(decl.name.clone(), decl.clone());
                Ok(true)
            }
        }
    }

    pub fn bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Result<&QueueDecl, BrokerError> {
        self.queues
            .get(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    /// Queues a message published to `exchange` with `routing_key` lands in.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|decl| decl.kind)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matches = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            };
            if matches && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    /// Stamp `message` as dead and resolve where it goes. Returns no targets
    /// when the queue has no dead-letter exchange; the message is discarded.
    pub fn dead_letter(
        &self,
        queue: &QueueDecl,
        mut message: Message,
        reason: &str,
    ) -> Vec<(String, Message)> {
        let Some(exchange) = queue.dead_letter_exchange.as_deref() else {
            tracing::warn!(
                queue = %queue.name,
                message_id = %message.id,
                reason,
                "Discarding message: queue has no dead-letter exchange"
            );
            return Vec::new();
        };

        message.mark_dead(&queue.name, reason);

        match self.route(exchange, &queue.name) {
            Ok(targets) => targets
                .into_iter()
                .map(|target| (target, message.clone()))
                .collect(),
            Err(err) => {
                tracing::warn!(
                    queue = %queue.name,
                    message_id = %message.id,
                    error = %err,
                    "Discarding message: dead-letter exchange is not routable"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DEATH_REASON_HEADER;

    fn table() -> RoutingTable {
        let mut table = RoutingTable::default();
        table.declare_exchange(&ExchangeDecl::direct("notifications.direct")).unwrap();
        table.declare_exchange(&ExchangeDecl::fanout("dlx.exchange")).unwrap();
        table.declare_queue(&QueueDecl::durable("dead.letter.queue")).unwrap();
        table
            .declare_queue(
                &QueueDecl::durable("email.queue").with_dead_letter_exchange("dlx.exchange"),
            )
            .unwrap();
        table
            .declare_queue(
                &QueueDecl::durable("push.queue").with_dead_letter_exchange("dlx.exchange"),
            )
            .unwrap();
        table.bind("dead.letter.queue", "dlx.exchange", "").unwrap();
        table.bind("email.queue", "notifications.direct", "email").unwrap();
        table.bind("push.queue", "notifications.direct", "push").unwrap();
        table
    }

    #[test]
    fn test_direct_routes_by_key() {
        let table = table();
        assert_eq!(table.route("notifications.direct", "push").unwrap(), vec!["push.queue"]);
        assert!(table.route("notifications.direct", "sms").unwrap().is_empty());
    }

    #[test]
    fn test_fanout_ignores_key() {
        let table = table();
        assert_eq!(table.route("dlx.exchange", "anything").unwrap(), vec!["dead.letter.queue"]);
    }

    #[test]
    fn test_default_exchange_routes_to_named_queue() {
        let table = table();
        assert_eq!(table.route("", "email.queue").unwrap(), vec!["email.queue"]);
        assert!(table.route("", "missing").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_exchange() {
        assert!(matches!(
            table().route("nope", "email"),
            Err(BrokerError::UnknownExchange(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_redeclare_is_idempotent_but_rejects_changes() {
        let mut table = table();
        assert!(table.declare_exchange(&ExchangeDecl::direct("notifications.direct")).is_ok());
        assert!(!table
            .declare_queue(
                &QueueDecl::durable("email.queue").with_dead_letter_exchange("dlx.exchange"),
            )
            .unwrap());
        assert!(matches!(
            table.declare_exchange(&ExchangeDecl::fanout("notifications.direct")),
            Err(BrokerError::PreconditionFailed(_))
        ));

        table.bind("email.queue", "notifications.direct", "email").unwrap();
        assert_eq!(table.route("notifications.direct", "email").unwrap().len(), 1);
    }

    #[test]
    fn test_bind_requires_declarations() {
        let mut table = table();
        assert!(matches!(
            table.bind("missing", "dlx.exchange", ""),
            Err(BrokerError::UnknownQueue(_))
        ));
        assert!(matches!(
            table.bind("email.queue", "missing", ""),
            Err(BrokerError::UnknownExchange(_))
        ));
    }

    #[test]
    fn test_dead_letter_stamps_and_routes() {
        let table = table();
        let queue = table.queue("push.queue").unwrap().clone();
        let targets = table.dead_letter(&queue, Message::new("x"), "rejected");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "dead.letter.queue");
        assert_eq!(targets[0].1.headers[DEATH_REASON_HEADER], "rejected");
    }

    #[test]
    fn test_dead_letter_without_exchange_discards() {
        let table = table();
        let queue = table.queue("dead.letter.queue").unwrap().clone();
        assert!(table.dead_letter(&queue, Message::new("x"), "rejected").is_empty());
    }
}
