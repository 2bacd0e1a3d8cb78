//! Watch streams feeding the inventory
//!
//! Initial listings are buffered between `Init` and `InitDone` and applied
//! as one replacement, so objects deleted while the watch was down vanish
//! from the inventory after a relist.

use async_trait::async_trait;
use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use link_api::v1alpha1::{Cluster, ClusterNode};
use link_core::{Inventory, Shutdown};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A kind the inventory tracks
#[async_trait]
pub trait Watched: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static {
    const KIND: &'static str;

    async fn apply(inventory: &Inventory, object: Self);

    async fn delete(inventory: &Inventory, object: Self);

    async fn replace(inventory: &Inventory, objects: Vec<Self>);
}

#[async_trait]
impl Watched for Cluster {
    const KIND: &'static str = "Cluster";

    async fn apply(inventory: &Inventory, object: Self) {
        inventory.apply_cluster(object).await;
    }

    async fn delete(inventory: &Inventory, object: Self) {
        inventory.delete_cluster(object.cluster_name()).await;
    }

    async fn replace(inventory: &Inventory, objects: Vec<Self>) {
        inventory.replace_clusters(objects).await;
    }
}

#[async_trait]
impl Watched for ClusterNode {
    const KIND: &'static str = "ClusterNode";

    async fn apply(inventory: &Inventory, object: Self) {
        inventory.apply_node(object).await;
    }

    async fn delete(inventory: &Inventory, object: Self) {
        inventory.delete_node(&object.node_key()).await;
    }

    async fn replace(inventory: &Inventory, objects: Vec<Self>) {
        inventory.replace_nodes(objects).await;
    }
}

/// Applies watch events of one kind to the inventory
pub struct InventoryFeed<K> {
    inventory: Arc<Inventory>,
    listing: Option<Vec<K>>,
}

impl<K: Watched> InventoryFeed<K> {
    pub fn new(inventory: Arc<Inventory>) -> Self {
        Self {
            inventory,
            listing: None,
        }
    }

    pub async fn handle(&mut self, event: Event<K>) {
        match event {
            Event::Init => {
                debug!("Listing {} objects", K::KIND);
                self.listing = Some(Vec::new());
            }
            Event::InitApply(object) => self.listing.get_or_insert_with(Vec::new).push(object),
            Event::InitDone => {
                let objects = self.listing.take().unwrap_or_default();
                info!("Listed {} {} objects", objects.len(), K::KIND);
                K::replace(&self.inventory, objects).await;
            }
            Event::Apply(object) => K::apply(&self.inventory, object).await,
            Event::Delete(object) => K::delete(&self.inventory, object).await,
        }
    }
}

/// Watch one kind until shutdown
pub async fn watch<K: Watched>(api: Api<K>, inventory: Arc<Inventory>, shutdown: Shutdown) {
    let mut feed = InventoryFeed::new(inventory);
    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    info!("Watching {} objects", K::KIND);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => feed.handle(event).await,
                Some(Err(e)) => warn!("{} watch error: {}", K::KIND, e),
                None => break,
            },
        }
    }
    info!("Stopped watching {} objects", K::KIND);
}
