//! cadence-types - Shared data types for cadence
//!
//! This crate contains pure data structures without heavy dependencies.
//! No tokio, no async runtime - just serde-serializable types.
//!
//! Used by:
//! - cadence-core (buffering, billing, scoring, orchestration)
//! - cadence (CLI)
//! - transport layers that speak the inbound/outbound wire shapes

pub mod feature;
pub mod models;
pub mod wire;

pub use feature::{Feature, FeatureKind, Mode, UnknownFeature};
pub use models::{
    ConversationId, Dimensions, FeatureUsage, LedgerEntry, PriceRule, RelationshipSnapshot, RelationshipStage, Unit,
    UsageSnapshot, WalletKey,
};
pub use wire::{InboundMessage, OutboundMessage};
