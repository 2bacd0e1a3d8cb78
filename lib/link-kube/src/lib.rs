//! Kubernetes integration for the network manager
pub mod client;
pub mod store;
pub mod watcher;

pub use client::LinkClient;
pub use store::{KubeClusterStatusStore, KubeNodeConfigStore};
pub use watcher::{watch, InventoryFeed, Watched};
