// Exchange market-data clients
pub mod kraken;

pub use kraken::{AssetPairInfo, CandleSource, KrakenClient, INTERVAL_4H_MIN, KRAKEN_API_BASE};
