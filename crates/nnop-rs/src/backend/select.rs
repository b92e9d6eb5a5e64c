//! Priority ladder used by initializers to choose among specialized code paths.
//!
//! Rules are tested in the order they are added, most specific first; the first rule whose
//! predicate holds wins and later predicates are not evaluated.
//!
//! ```ignore
//! let path = PathLadder::new("conv2d")
//!     .rule(ConvPath::Pointwise, geometry.is_pointwise_unpadded())
//!     .rule(ConvPath::Im2col, true)
//!     .select();
//! ```

use std::fmt::Debug;

use tracing::{debug, trace};

#[derive(Debug)]
pub struct PathLadder<P> {
    op: &'static str,
    chosen: Option<P>,
}

impl<P: Copy + Debug> PathLadder<P> {
    pub fn new(op: &'static str) -> Self {
        PathLadder { op, chosen: None }
    }

    pub fn rule(self, path: P, matches: bool) -> Self {
        self.rule_with(path, || matches)
    }

    /// Like [`PathLadder::rule`], evaluating the predicate only when no earlier rule matched.
    pub fn rule_with(mut self, path: P, predicate: impl FnOnce() -> bool) -> Self {
        if self.chosen.is_none() {
            let matched = predicate();
            trace!(op = self.op, ?path, matched, "path predicate");
            if matched {
                self.chosen = Some(path);
            }
        }
        self
    }

    /// The first matching path, or `None` when the backend cannot serve the instance.
    pub fn select(self) -> Option<P> {
        match self.chosen {
            Some(path) => debug!(op = self.op, ?path, "path selected"),
            None => debug!(op = self.op, "no path matched"),
        }
        self.chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins_and_short_circuits() {
        let mut evaluated = false;
        let chosen = PathLadder::new("test")
            .rule(1, false)
            .rule(2, true)
            .rule_with(3, || {
                evaluated = true;
                true
            })
            .select();
        assert_eq!(chosen, Some(2));
        assert!(!evaluated);
    }

    #[test]
    fn empty_ladder_selects_nothing() {
        assert_eq!(PathLadder::<u8>::new("test").rule(1, false).select(), None);
    }
}
