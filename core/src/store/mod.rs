//! Backing store access: a narrow gateway trait over the timeseries
//! database plus the SQL the control plane derives itself.

pub mod gateway;
pub mod sql;

pub use gateway::{QueryOutput, QuestDbGateway, StoreGateway};
pub use sql::ReplayRow;
