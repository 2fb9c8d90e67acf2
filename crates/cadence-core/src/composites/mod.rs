//! Composite operators
//!
//! Composites are states that own and drive an ordered list of child
//! states, each with a distinct concurrency/ordering policy:
//!
//! - [`chain`]: Sequential (AND, in order) and Selector (OR, in order)
//! - [`parallel`]: Parallel (all at once) and its at-least-one variant
//! - [`random_pick`]: one uniformly picked child per activation
//!
//! Shared invariant: once the composite's own activation task exits with
//! a terminal status, none of its children is still running.

pub(crate) mod chain;
pub(crate) mod parallel;
pub(crate) mod random_pick;
