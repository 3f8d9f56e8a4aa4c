//! Small, storage-independent helpers shared by the planner, the clock and
//! the scheduler.
//!
//! Current helpers:
//! - Calendar arithmetic over `chrono::NaiveDate` (business days, month,
//!   quarter and year boundaries, and the back-dated resume anchors used by
//!   quarterly and yearly datasets).
//! - Deterministic ordering of row segments.
pub mod calendar;
pub mod segment_order;
