pub mod capacity;
pub mod config;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod ledger_store;
pub mod models;
pub mod node_registry;
pub mod reclaimer;
pub mod swarm;
pub mod task_queue;
pub mod transport;
