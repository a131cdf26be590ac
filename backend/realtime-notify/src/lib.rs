pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;

pub use broker::{
    Broker, BrokerConfig, BrokerStats, ConnectionId, ConnectionState, Event, OpenedConnection,
    PublishOutcome, Sink, UserId,
};
pub use config::Config;
pub use error::{AppError, AppResult, BrokerError, Result, WriteError};
pub use handlers::AppState;
