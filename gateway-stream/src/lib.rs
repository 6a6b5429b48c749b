#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_extern_crates
)]

//! # Streaming Data Plane
//!
//! Two persistent hub connections — market data and per-account user
//! events — with change-detecting fan-out to the message bus. The market
//! hub deduplicates quotes/trades/depth against [`quote_cache::QuoteCache`]
//! and clears it on reconnect so resubscription never silently suppresses
//! the next tick; the user hub demultiplexes five canonical broker events
//! and re-subscribes if it goes quiet for longer than
//! [`user::LIVENESS_TIMEOUT`].

pub mod auth_bridge;
pub mod bus;
pub mod event;
pub mod market;
pub mod normalize;
pub mod quote_cache;
pub mod side;
pub mod user;
pub mod ws_transport;

pub use bus::{NullPublisher, Publisher};
pub use event::{MarketEvent, MarketEventKind, UserEvent};
pub use market::{reconnect_delay, MarketHub, MarketHubTransport, MarketMetrics, StreamError};
pub use quote_cache::{Depth, DepthLevel, Quote, QuoteCache, Trade};
pub use side::{decode_position_side, decode_side_numeric, decode_side_text, PositionSide, Side};
pub use user::{UserHub, UserHubTransport, LIVENESS_TIMEOUT};
pub use ws_transport::{WsMarketTransport, WsUserTransport};
