//! Tuple flattening for chained fusion.
//!
//! Chained fuse-family operators produce left-nested pairs
//! (`((A, B), C)`); `flattened` collapses one level of nesting so the
//! chain stays a flat tuple, up through arity seven.

use crate::stream::Stream;

impl<A, B, C> Stream<((A, B), C)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
{
    /// Collapses `((A, B), C)` into `(A, B, C)`.
    pub fn flattened(&self) -> Stream<(A, B, C)> {
        self.select(|((a, b), c)| (a, b, c))
    }
}

impl<A, B, C, D> Stream<((A, B, C), D)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
    D: Clone + Send + 'static,
{
    /// Collapses `((A, B, C), D)` into `(A, B, C, D)`.
    pub fn flattened(&self) -> Stream<(A, B, C, D)> {
        self.select(|((a, b, c), d)| (a, b, c, d))
    }
}

impl<A, B, C, D, E> Stream<((A, B, C, D), E)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
    D: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Collapses `((A, B, C, D), E)` into `(A, B, C, D, E)`.
    pub fn flattened(&self) -> Stream<(A, B, C, D, E)> {
        self.select(|((a, b, c, d), e)| (a, b, c, d, e))
    }
}

impl<A, B, C, D, E, F> Stream<((A, B, C, D, E), F)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
    D: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    /// Collapses `((A, B, C, D, E), F)` into `(A, B, C, D, E, F)`.
    pub fn flattened(&self) -> Stream<(A, B, C, D, E, F)> {
        self.select(|((a, b, c, d, e), f)| (a, b, c, d, e, f))
    }
}

impl<A, B, C, D, E, F, G> Stream<((A, B, C, D, E, F), G)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
    D: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: Clone + Send + 'static,
    G: Clone + Send + 'static,
{
    /// Collapses `((A, B, C, D, E, F), G)` into `(A, B, C, D, E, F, G)`.
    pub fn flattened(&self) -> Stream<(A, B, C, D, E, F, G)> {
        self.select(|((a, b, c, d, e, f), g)| (a, b, c, d, e, f, g))
    }
}
