// crates/challengectl-core/src/lib.rs
// ============================================================================
// Crate: challengectl-core
// Description: Entity types, identifiers, hashing, and trait seams shared by
//              every other ChallengeCtl crate.
// Purpose: A dependency-light foundation crate with no I/O of its own, so it
//          can be used from the dispatch core, the API layer, the runner
//          agent, and every store/blobstore backend without cycles.
// ============================================================================

//! # challengectl-core
//!
//! Pure data types and trait definitions for the ChallengeCtl dispatch
//! system. This crate performs no I/O: it defines what a [`Challenge`],
//! [`Runner`], or [`Transmission`] *is*, and the trait boundaries
//! ([`DurableStore`], [`BlobStore`], [`EventLog`], [`AuthAuditSink`]) that
//! every backend implements and every consumer depends on instead of a
//! concrete storage technology.

pub mod core;
pub mod interfaces;

pub use crate::core::hashing::canonical_json_bytes;
pub use crate::core::hashing::sha256_hex;
pub use crate::core::hashing::CanonicalizeError;
pub use crate::core::identifiers::ChallengeId;
pub use crate::core::identifiers::DeviceId;
pub use crate::core::identifiers::EnrollmentToken;
pub use crate::core::identifiers::FileDigest;
pub use crate::core::identifiers::RunnerId;
pub use crate::core::identifiers::TransmissionId;
pub use crate::core::model::Challenge;
pub use crate::core::model::ChallengeConfig;
pub use crate::core::model::ChallengeStatus;
pub use crate::core::model::Device;
pub use crate::core::model::EnrollmentTokenRecord;
pub use crate::core::model::FileReference;
pub use crate::core::model::FileRecord;
pub use crate::core::model::FrequencyRange;
pub use crate::core::model::FrequencySpec;
pub use crate::core::model::Principal;
pub use crate::core::model::Runner;
pub use crate::core::model::RunnerStatus;
pub use crate::core::model::Transmission;
pub use crate::core::model::TransmissionStatus;
pub use crate::core::time::Timestamp;
pub use crate::interfaces::AuthAuditEvent;
pub use crate::interfaces::AuthAuditSink;
pub use crate::interfaces::BlobStore;
pub use crate::interfaces::BlobStoreError;
pub use crate::interfaces::ByteStream;
pub use crate::interfaces::ChallengeConfigUpsert;
pub use crate::interfaces::DashboardStats;
pub use crate::interfaces::DisableOutcome;
pub use crate::interfaces::DurableStore;
pub use crate::interfaces::EnrollOutcome;
pub use crate::interfaces::Event;
pub use crate::interfaces::EventLog;
pub use crate::interfaces::MintEnrollmentTokenInput;
pub use crate::interfaces::NoopAuditSink;
pub use crate::interfaces::PrincipalClass;
pub use crate::interfaces::ReportCompleteInput;
pub use crate::interfaces::ReportCompleteOutcome;
pub use crate::interfaces::RunnerRegistration;
pub use crate::interfaces::SignoutOutcome;
pub use crate::interfaces::StderrAuditSink;
pub use crate::interfaces::StoreError;
