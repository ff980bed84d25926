// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! An in-process duplex-pipe medium used exclusively by integration tests,
//! grounded on the in-memory test pipe the original source's platform
//! layer provides for its own unit tests (`internal/platform/base_pipe.h`).
//! Not part of the public API surface a real medium driver implements
//! against; production drivers live entirely outside this crate.

use crate::medium::{Accepted, BoxedStream, DiscoveryEvent, DiscoverySink, MediumDriver, MediumError};
use nearby_core::Medium;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

struct Advertiser {
    advertisement: Vec<u8>,
    accept_tx: mpsc::UnboundedSender<Accepted>,
}

type Acceptor = Arc<AsyncMutex<mpsc::UnboundedReceiver<Accepted>>>;

#[derive(Default)]
struct NetworkInner {
    advertisers: HashMap<String, Advertiser>,
    discoverers: HashMap<String, Vec<mpsc::UnboundedSender<DiscoveryEvent>>>,
    acceptors: HashMap<String, Acceptor>,
}

/// A shared in-memory network that any number of [`MemoryMedium`] handles
/// can advertise/discover/connect over, standing in for the physical air
/// interface a real medium shares between devices.
#[derive(Clone, Default)]
pub struct Network(Arc<StdMutex<NetworkInner>>);

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a driver handle bound to this network for one medium tag.
    pub fn medium(&self, tag: Medium) -> MemoryMedium {
        MemoryMedium {
            tag,
            network: self.clone(),
        }
    }
}

/// A [`MediumDriver`] backed by [`Network`], carrying a fixed medium tag so
/// tests can exercise a bandwidth upgrade between two `MemoryMedium`
/// instances bound to distinct `Network`s (one per simulated medium).
#[derive(Clone)]
pub struct MemoryMedium {
    tag: Medium,
    network: Network,
}

impl MemoryMedium {
    /// A driver on its own private network — typically paired with another
    /// instance via [`Self::paired_with`] once both devices' handles exist.
    pub fn new(tag: Medium) -> Self {
        Self {
            tag,
            network: Network::new(),
        }
    }

    /// Builds a driver sharing `other`'s underlying network, so the two can
    /// see each other's advertisements.
    pub fn paired_with(tag: Medium, other: &MemoryMedium) -> Self {
        Self {
            tag,
            network: other.network.clone(),
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

#[async_trait::async_trait]
impl MediumDriver for MemoryMedium {
    fn medium(&self) -> Medium {
        self.tag
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn advertise(&self, service_id: &str, advertisement: &[u8]) -> Result<(), MediumError> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let mut inner = self.network.0.lock().unwrap();
        inner.advertisers.insert(
            service_id.to_string(),
            Advertiser {
                advertisement: advertisement.to_vec(),
                accept_tx,
            },
        );
        inner.acceptors.insert(
            service_id.to_string(),
            Arc::new(AsyncMutex::new(accept_rx)),
        );
        for tx in inner.discoverers.entry(service_id.to_string()).or_default() {
            let _ = tx.send(DiscoveryEvent::Found {
                medium: self.tag,
                advertisement: advertisement.to_vec(),
            });
        }
        Ok(())
    }

    async fn stop_advertise(&self, service_id: &str) -> Result<(), MediumError> {
        let mut inner = self.network.0.lock().unwrap();
        inner.acceptors.remove(service_id);
        if let Some(advertiser) = inner.advertisers.remove(service_id) {
            if let Some(txs) = inner.discoverers.get(service_id) {
                for tx in txs {
                    let _ = tx.send(DiscoveryEvent::Lost {
                        advertisement: advertiser.advertisement.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn discover(
        &self,
        service_id: &str,
        sink: Arc<dyn DiscoverySink>,
    ) -> Result<(), MediumError> {
        let mut rx = self.subscribe(service_id);
        let service_id = service_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.on_discovery_event(&service_id, event).await;
            }
        });
        Ok(())
    }

    async fn stop_discover(&self, service_id: &str) -> Result<(), MediumError> {
        let mut inner = self.network.0.lock().unwrap();
        inner.discoverers.remove(service_id);
        Ok(())
    }

    async fn connect(
        &self,
        _remote_endpoint_id: &str,
        service_id: &str,
    ) -> Result<BoxedStream, MediumError> {
        let accept_tx = {
            let inner = self.network.0.lock().unwrap();
            inner
                .advertisers
                .get(service_id)
                .map(|a| a.accept_tx.clone())
                .ok_or(MediumError::ConnectFailed)?
        };
        let (local, remote) = tokio::io::duplex(64 * 1024);
        accept_tx
            .send(Accepted {
                medium: self.tag,
                stream: Box::new(remote),
            })
            .map_err(|_| MediumError::ConnectFailed)?;
        Ok(Box::new(local))
    }

    async fn accept(&self, service_id: &str) -> Result<Accepted, MediumError> {
        let acceptor = {
            let inner = self.network.0.lock().unwrap();
            inner
                .acceptors
                .get(service_id)
                .cloned()
                .ok_or(MediumError::Unavailable)?
        };
        let mut rx = acceptor.lock().await;
        rx.recv().await.ok_or(MediumError::Unavailable)
    }

    async fn teardown(&self, service_id: &str) -> Result<(), MediumError> {
        self.stop_advertise(service_id).await
    }
}

impl MemoryMedium {
    /// Subscribes to discovery events for `service_id`, delivering a
    /// `Found` for any advertisement already active plus every future
    /// advertise/stop_advertise on this network. The `MediumDriver::discover`
    /// trait method above exists to satisfy the production-shaped contract;
    /// tests that need to actually observe events call this instead.
    pub fn subscribe(&self, service_id: &str) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.network.0.lock().unwrap();
        if let Some(advertiser) = inner.advertisers.get(service_id) {
            let _ = tx.send(DiscoveryEvent::Found {
                medium: self.tag,
                advertisement: advertiser.advertisement.clone(),
            });
        }
        inner
            .discoverers
            .entry(service_id.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
