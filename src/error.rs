//! Centralized error types for the trading engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // Precondition / user input
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Unknown pair: {0}")]
    UnknownPair(String),

    #[error("Duplicate bot: {0}")]
    DuplicateBot(String),

    #[error("Bot is running: {0}")]
    BotRunning(String),

    #[error("Bot not found: {0}")]
    BotNotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Order below exchange minimum: {0}")]
    BelowMinimum(String),

    // Network
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Subscription not confirmed: {0}")]
    NotSubscribed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // Exchange
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Order not found: {0}")]
    OrderMissing(String),

    #[error("Invalid credentials: {0}")]
    Credential(String),

    // Storage
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Entity not found: {0}")]
    NotFound(String),

    // Domain
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Bounded loss reached: {0}")]
    BoundedLoss(String),

    // System
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Transient: retry on the next scheduled tick, never tight-loop.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, EngineError::RateLimited(_))
    }

    /// The order already reached a terminal state on the exchange;
    /// the private stream delivers the final outcome.
    pub fn is_order_missing(&self) -> bool {
        matches!(self, EngineError::OrderMissing(_))
    }

    /// Critical for a live bot: stop it and write status = Error.
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            EngineError::Credential(_) | EngineError::UnknownPair(_)
        )
    }

    /// Caller mistake, surfaced as a 4xx-equivalent. No state was mutated.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientBalance(_)
                | EngineError::UnknownPair(_)
                | EngineError::DuplicateBot(_)
                | EngineError::BotRunning(_)
                | EngineError::BotNotFound(_)
                | EngineError::InvalidParameter(_)
                | EngineError::BelowMinimum(_)
        )
    }
}

/// Map a raw exchange error message onto a classified error. The exchange
/// reports failures as free-text messages, so this is string inspection.
pub fn classify_exchange_message(message: &str) -> EngineError {
    let lower = message.to_lowercase();

    if lower.contains("too many requests") || lower.contains("rate limit") {
        EngineError::RateLimited(message.to_string())
    } else if lower.contains("order not found")
        || lower.contains("invalid order")
        || lower.contains("tidak ditemukan")
    {
        EngineError::OrderMissing(message.to_string())
    } else if lower.contains("invalid credentials")
        || lower.contains("invalid key")
        || lower.contains("invalid signature")
        || lower.contains("bad sign")
    {
        EngineError::Credential(message.to_string())
    } else if lower.contains("unknown pair") || lower.contains("invalid pair") {
        EngineError::UnknownPair(message.to_string())
    } else if lower.contains("insufficient") || lower.contains("balance") {
        EngineError::InsufficientBalance(message.to_string())
    } else {
        EngineError::Exchange(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_exchange_message("Too many requests, slow down");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_classify_missing_order() {
        let err = classify_exchange_message("Order not found or already finished");
        assert!(err.is_order_missing());
    }

    #[test]
    fn test_classify_credential() {
        let err = classify_exchange_message("Invalid credentials. Bad sign");
        assert!(err.is_credential());
    }

    #[test]
    fn test_classify_other() {
        let err = classify_exchange_message("Something unexpected");
        assert!(!err.is_rate_limited());
        assert!(!err.is_order_missing());
        assert!(!err.is_credential());
    }
}
