pub mod store;
pub mod tracker;
pub mod types;

pub use store::PositionStore;
pub use tracker::{LifecycleState, OrderLifecycleTracker};
pub use types::{OrderRefs, Position, Side};
