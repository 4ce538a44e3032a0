//! Interconnect topology and topology-aware device selection.

pub mod allocator;
pub mod graph;

pub use allocator::Allocator;
pub use allocator::ExactAllocator;
pub use graph::Graph;

/// Edge weight for a link class: `(class + 1)^2`.
///
/// Squaring makes uniformly strong sets win over sets that trade one strong
/// link against several weak ones.
pub fn link_weight(link_class: u32) -> u64 {
    let base = u64::from(link_class) + 1;
    base * base
}
