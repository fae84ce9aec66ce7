//! Pure decision logic: outcome algebra, selection predicates, the index
//! data model, and xfail resolution. Nothing here touches processes, the
//! filesystem, or git.

pub mod outcome;
pub mod predicate;
pub mod types;
pub mod xfail;
