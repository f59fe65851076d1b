//! Field mapping engine and transform set

mod engine;
mod transform;

pub use engine::{
    map_external_to_internal, map_internal_to_external, outbound_changes, MappingEngine,
};
pub use transform::Transform;
