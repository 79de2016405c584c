//! Business handlers shipped with the agent: MSN-style hourly weather
//! snapshots, licensed stock quotes, and signal monitors over the persisted
//! quote history. The fetching handlers run their targets through the
//! shared bounded fetcher; everything persists through the `RecordStore`
//! seam.

pub mod geo;
pub mod quotes;
pub mod signals;
pub mod weather;

pub use quotes::{QuoteApi, QuotesHandler, COMMAND_FETCH_QUOTES, QUOTES_DOMAIN};
pub use signals::{
    LogNotifier, MaCrossHandler, RsiHandler, SignalAlert, SignalNotifier, COMMAND_RUN_MA_CROSS,
    COMMAND_RUN_RSI, SIGNALS_DOMAIN,
};
pub use weather::{WeatherApi, WeatherHandler, COMMAND_FETCH_WEATHER, WEATHER_DOMAIN};
