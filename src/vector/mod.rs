//! Vector storage and k-nearest-neighbour search

pub mod index;

pub use index::{DistanceMetric, VectorError, VectorIndex, VectorResult};
