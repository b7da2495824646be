pub mod capacity;
pub mod heartbeat;
pub mod lifecycle;
pub mod node;
pub mod placement;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
