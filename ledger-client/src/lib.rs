//! Ledger client boundary
//!
//! This crate provides:
//! - Ed25519 key pairs and addresses used by every ledger account
//! - The transaction model (operations, memos, fee bumps) and its hashing
//! - The `LedgerClient` trait with an HTTP implementation and an in-memory ledger
//! - The ledger error taxonomy separating transient failures from terminal rejections

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod error;
pub mod http;
pub mod keys;
pub mod mock;
pub mod transaction;

pub use client::{AccountDetail, Balance, LedgerClient, SubmitResponse, TransactionRecord};
pub use error::{LedgerError, Result, ResultCodes};
pub use http::{HttpLedgerClient, HttpLedgerConfig};
pub use keys::KeyPair;
pub use mock::MockLedger;
pub use transaction::{
    Asset, DecoratedSignature, FeeBumpTransaction, Memo, Operation, OperationBody,
    SignedFeeBumpTransaction, SignedTransaction, TimeBounds, Transaction, TransactionEnvelope,
    BASE_FEE,
};
