//! [`Transport`] on top of the `bluest` BLE library.
//!
//! bluest is async while the session engine is polled, so every radio operation runs in a
//! task on the tokio runtime and reports back through a channel that the next poll checks.
//! Service discovery happens as part of connecting, which lets `resolve_service` and
//! `resolve_characteristic` answer from a cache.
use crate::transport::{ConnectPoll, NotificationSink, PeerFilter, ScanPoll, Transport};
use anyhow::{anyhow, Context};
use bluest::{Adapter, Characteristic, Device, Service, Uuid};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// How often an established link is checked for a silent disconnect.
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// A connected peer and its discovered GATT tree.
struct Link {
    device: Device,
    services: Vec<(Service, Vec<Characteristic>)>,
}

struct Pending<T> {
    task: JoinHandle<()>,
    result: oneshot::Receiver<T>,
}

pub struct BluestTransport {
    adapter: Adapter,
    runtime: Handle,
    scan: Option<Pending<Device>>,
    connect: Option<Pending<anyhow::Result<Link>>>,
    link: Option<Link>,
    link_up: Arc<AtomicBool>,
    writer: Option<mpsc::UnboundedSender<(Characteristic, Vec<u8>)>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BluestTransport {
    /// Open the default adapter. Must be called from within a tokio runtime.
    pub async fn new() -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await.context("Bluetooth adapter not available")?;

        Ok(Self {
            adapter,
            runtime: Handle::current(),
            scan: None,
            connect: None,
            link: None,
            link_up: Arc::new(AtomicBool::new(false)),
            writer: None,
            tasks: Vec::new(),
        })
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(pending) = self.connect.take() {
            pending.task.abort();
        }
        self.writer = None;
    }

    /// Start the writer and the link watchdog for a freshly connected peer.
    ///
    /// The link flag is replaced per link. Tasks of an earlier link only hold the old one.
    fn start_link_tasks(&mut self, device: Device) {
        self.abort_tasks();
        self.link_up = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel::<(Characteristic, Vec<u8>)>();
        let link_up = self.link_up.clone();
        self.tasks.push(self.runtime.spawn(async move {
            while let Some((characteristic, bytes)) = rx.recv().await {
                if let Err(err) = characteristic.write_without_response(&bytes).await {
                    warn!("BLE write failed: {err}");
                    link_up.store(false, Ordering::SeqCst);
                }
            }
        }));
        self.writer = Some(tx);

        let link_up = self.link_up.clone();
        self.tasks.push(self.runtime.spawn(async move {
            loop {
                sleep(LINK_CHECK_INTERVAL).await;
                if !device.is_connected().await {
                    info!("BLE link dropped by the peer");
                    link_up.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }));
    }
}

async fn find_device(adapter: Adapter, filter: PeerFilter) -> anyhow::Result<Device> {
    let mut advertisements = adapter.scan(&[]).await?;
    while let Some(advertisement) = advertisements.next().await {
        let device = advertisement.device;
        let name = match advertisement.adv_data.local_name {
            Some(name) => Some(name),
            None => device.name_async().await.ok(),
        };
        let address = format!("{:?}", device.id());
        if filter.matches(name.as_deref(), &address) {
            info!("Matched {} at {address}", name.as_deref().unwrap_or("unnamed device"));
            return Ok(device);
        }
    }
    Err(anyhow!("Scan ended"))
}

async fn establish(adapter: Adapter, device: Device, use_bonding: bool) -> anyhow::Result<Link> {
    adapter.connect_device(&device).await.context("Failed to connect")?;

    if use_bonding && !device.is_paired().await.unwrap_or(false) {
        debug!("Pairing");
        device.pair().await.context("Failed to pair")?;
    }

    let mut services = Vec::new();
    for service in device.discover_services().await.context("Service discovery failed")? {
        let characteristics = service
            .discover_characteristics()
            .await
            .context("Characteristic discovery failed")?;
        services.push((service, characteristics));
    }
    Ok(Link { device, services })
}

impl Transport for BluestTransport {
    type Peer = Device;
    type Service = Service;
    type Characteristic = Characteristic;

    fn start_scan(&mut self, filter: &PeerFilter) -> bool {
        self.stop_scan();
        let (tx, result) = oneshot::channel();
        let adapter = self.adapter.clone();
        let filter = filter.clone();
        let task = self.runtime.spawn(async move {
            match find_device(adapter, filter).await {
                Ok(device) => {
                    let _ = tx.send(device);
                }
                Err(err) => warn!("BLE scan failed: {err:#}"),
            }
        });
        self.scan = Some(Pending { task, result });
        true
    }

    fn poll_scan(&mut self) -> ScanPoll<Device> {
        let Some(pending) = self.scan.as_mut() else {
            return ScanPoll::Pending;
        };
        match pending.result.try_recv() {
            Ok(device) => ScanPoll::Found(device),
            Err(_) => ScanPoll::Pending,
        }
    }

    fn stop_scan(&mut self) {
        if let Some(pending) = self.scan.take() {
            pending.task.abort();
        }
    }

    fn start_connect(&mut self, peer: &Device, use_bonding: bool) -> bool {
        if let Some(pending) = self.connect.take() {
            pending.task.abort();
        }
        let (tx, result) = oneshot::channel();
        let adapter = self.adapter.clone();
        let device = peer.clone();
        let task = self.runtime.spawn(async move {
            let _ = tx.send(establish(adapter, device, use_bonding).await);
        });
        self.connect = Some(Pending { task, result });
        true
    }

    fn poll_connect(&mut self) -> ConnectPoll {
        let Some(pending) = self.connect.as_mut() else {
            return ConnectPoll::Failed("No connection attempt in progress".to_string());
        };
        match pending.result.try_recv() {
            Ok(Ok(link)) => {
                self.connect = None;
                self.start_link_tasks(link.device.clone());
                self.link = Some(link);
                ConnectPoll::Established
            }
            Ok(Err(err)) => {
                self.connect = None;
                ConnectPoll::Failed(format!("{err:#}"))
            }
            Err(oneshot::error::TryRecvError::Empty) => ConnectPoll::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.connect = None;
                ConnectPoll::Failed("Connection task ended".to_string())
            }
        }
    }

    fn resolve_service(&mut self, uuid: Uuid) -> Option<Service> {
        self.link
            .as_ref()?
            .services
            .iter()
            .find(|(service, _)| service.uuid() == uuid)
            .map(|(service, _)| service.clone())
    }

    fn resolve_characteristic(&mut self, service: &Service, uuid: Uuid) -> Option<Characteristic> {
        self.link
            .as_ref()?
            .services
            .iter()
            .find(|(candidate, _)| candidate == service)?
            .1
            .iter()
            .find(|characteristic| characteristic.uuid() == uuid)
            .cloned()
    }

    /// Starts the notification stream in the background. A stream that fails to start or
    /// ends marks the link as down.
    fn subscribe(&mut self, characteristic: &Characteristic, sink: NotificationSink) -> bool {
        if !self.is_link_up() {
            return false;
        }
        let characteristic = characteristic.clone();
        let link_up = self.link_up.clone();
        self.tasks.push(self.runtime.spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(notifications) => notifications,
                Err(err) => {
                    warn!("Failed to subscribe: {err}");
                    link_up.store(false, Ordering::SeqCst);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                match notification {
                    Ok(data) => {
                        if !sink.deliver(data) {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("Notification error: {err}");
                        break;
                    }
                }
            }
            info!("End of notification stream");
            link_up.store(false, Ordering::SeqCst);
        }));
        true
    }

    fn write_no_response(&mut self, characteristic: &Characteristic, bytes: &[u8]) -> bool {
        if !self.is_link_up() {
            return false;
        }
        self.writer
            .as_ref()
            .is_some_and(|writer| writer.send((characteristic.clone(), bytes.to_vec())).is_ok())
    }

    fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    fn disconnect(&mut self) {
        self.abort_tasks();
        self.link_up.store(false, Ordering::SeqCst);
        if let Some(link) = self.link.take() {
            let adapter = self.adapter.clone();
            self.runtime.spawn(async move {
                if let Err(err) = adapter.disconnect_device(&link.device).await {
                    debug!("Disconnect failed: {err}");
                }
            });
        }
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        self.stop_scan();
        self.abort_tasks();
    }
}
