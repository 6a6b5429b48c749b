//! Gateway connection-state machine, published on `connection:status`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Starting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

impl ConnectionStatus {
    pub fn as_event_type(self) -> &'static str {
        match self {
            ConnectionStatus::Starting => "STARTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Reconnecting => "RECONNECTING",
            ConnectionStatus::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}
