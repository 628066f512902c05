pub mod aggregator;
pub mod comparator;
pub mod domain;
pub mod judge;
pub mod language;
pub mod pipeline;
pub mod traits;
