//! Gateway core: the typed configuration surface, the aggregating error
//! type, structured logging setup, the connection-state machine, the
//! shutdown trait dispatch, statistics aggregation, and the Request Router
//! that ties every subsystem crate (auth, bus, sync, markets, stream,
//! execution, risk) into one dispatch surface.

pub mod config;
pub mod error;
pub mod logging;
pub mod router;
pub mod shutdown;
pub mod state;
pub mod stats;

pub use config::{BracketConfigInput, GatewayConfig, HistoricalDataConfig, OrderMutexConfig, ReconciliationConfigInput};
pub use error::GatewayError;
pub use logging::{init_json_logging, init_logging};
pub use router::GatewayCore;
pub use shutdown::{AsyncShutdown, Shutdown, SyncShutdown};
pub use state::ConnectionStatus;
pub use stats::{aggregate, AggregatedStats};
