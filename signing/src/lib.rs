//! Signature service
//!
//! Callers ask for a transaction to be signed by a set of accounts; the router picks the
//! signature client registered for each account type. Key material stays inside the
//! clients: environment secrets for host and env-type distribution accounts, encrypted
//! database rows for channel accounts and vault-type distribution accounts.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod encryption;
pub mod error;
pub mod router;
pub mod service;
pub mod store;

pub use client::{AccountEnvSignatureClient, DbVaultSignatureClient, SignatureClient};
pub use encryption::{AesGcmEncrypter, PrivateKeyEncrypter};
pub use error::{Result, SigningError};
pub use router::SignerRouter;
pub use service::{DistributionSignerType, SignatureService, SignatureServiceOptions};
pub use store::{
    InMemorySignerKeyStore, PgSignerKeyStore, SignerKeyStore, SignerTable, StoredSigner,
};
