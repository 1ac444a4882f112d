pub mod anomaly {
    pub mod engine;
    pub mod rules;
    pub mod types;
    pub mod window;
}
pub mod config;
pub mod db;
pub mod enforcement;
pub mod indexer {
    pub mod chain;
    pub mod decoder;
    pub mod mempool;
    pub mod types;
}
pub mod orchestrator;
pub mod pipeline;
pub mod rules;
pub mod watchlist;
