//! 🔄 Transforms: where one nested record becomes many flat rows 🎭
//!
//! ```text
//!   InNetworkRecord ──▶ router::route ──▶ Some(key) ──▶ flatten::flatten ──▶ FlatRow × N
//!                                   └──▶ None (dropped, not erred)      └──▶ reference ids
//! ```
//!
//! Both halves are pure: no I/O, no allocation of output resources, no opinions about
//! where rows end up. The writer pool handles that. These just do math on JSON. 🦆

pub(crate) mod flatten;
pub(crate) mod router;

pub use flatten::{FlatRow, OUTPUT_COLUMNS, PreparedPrice, RecordContext};
pub use router::{MatchMode, Router, RoutingConfig};
