pub mod reconcile;

pub use reconcile::{DEFAULT_BATCH_WIDTH, ReconcileConfig, ReconcileOperation, TickReport};
