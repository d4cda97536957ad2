//! Shared data model for the monitord control plane.
//!
//! Types in this crate are serialization-ready and carry no behavior beyond
//! parsing/rendering of their own textual forms. All control-plane logic
//! lives in `monitord-core`; the HTTP layer in `monitord-server` exchanges
//! these types with clients.

pub mod event;
pub mod interval;
pub mod policy;
pub mod signature;
pub mod snapshot;
pub mod watermark;

pub use event::{
    PredicateOccurrence, RawEvent, RawEventDocument, RawPredicate, SkipReason, Timepoint,
};
pub use interval::{ArgConstraint, IntervalBound, IntervalParseError, RelativeInterval};
pub use policy::{Monitorability, Policy};
pub use signature::{ArgSort, PredicateDecl, Signature, SignatureParseError};
pub use snapshot::{ConfigSnapshot, DbParams};
pub use watermark::Watermark;
