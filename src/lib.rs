pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod storage;
pub mod telemetry;

pub use application::{
    AdjustmentOutcome, AdjustmentRequest, BulkAdjustmentReport, BulkAdjustmentRequest,
    CreditLedger, LedgerError,
};
pub use config::LedgerConfig;
pub use domain::*;
