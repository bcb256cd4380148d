//! Model family tags and the assembled pipeline

pub mod family;
pub mod pipeline;

pub use family::{HiddenStateSelection, ModelFamily};
pub use pipeline::{Component, ComponentSlot, Pipeline, WeightSource};
