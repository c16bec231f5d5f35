// src/lib.rs

pub mod config;
pub mod consensus;
pub mod contracts;
pub mod crypto;
pub mod ledger;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod validators;
