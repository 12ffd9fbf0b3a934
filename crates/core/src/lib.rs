pub mod config;
pub mod errors;
pub mod models;

pub use config::{DatabaseConfig, NodeConfig};
pub use errors::{NodeError, Result};
pub use models::{
    PeriodUnit, RowImage, RowPatch, TaskPatch, TaskRow, TaskSpawn, TaskState, WorkerPatch,
    WorkerRow,
};
