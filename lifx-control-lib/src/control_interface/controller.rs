//! The public entry point: binds the socket and runs the event loop that owns the
//! [`DeviceRegistry`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::control_interface::{
    Device, DeviceRegistry, Group, LightEvent, ProductCapabilities,
};
use crate::led::hsbk::Hsbk;
use crate::protocol::{DeviceId, GroupId};
use crate::util::config::ControllerConfig;
use crate::util::tracker::{HandlerId, TimerFired};
use crate::util::transport::{CorrelationId, InboundFrame, UdpTransport};

type RegistryCall = Box<dyn FnOnce(&mut DeviceRegistry) + Send>;

enum Command {
    Call(RegistryCall),
    Shutdown,
}

/**
 * Cloneable handle to a running controller.
 *
 * Every method is answered by the event loop straight away; nothing waits for the
 * network. What devices do in response is published as [`LightEvent`]s, see
 * [`LightController::subscribe`].
 */
#[derive(Clone)]
pub struct LightController {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<LightEvent>,
    local_addr: SocketAddr,
}

impl LightController {
    /// Bind the socket and start the receive task and the event loop.
    pub async fn start(config: ControllerConfig) -> Result<Self> {
        config.validate().context("Invalid controller configuration")?;
        let udp = UdpTransport::bind(&config).await?;

        let (frame_tx, frame_rx) = mpsc::channel(config.receive_queue_capacity);
        let receiver = udp.spawn_receiver(frame_tx);
        let transport = Arc::new(udp.transport(config.broadcast_socket_addr()));

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let registry = DeviceRegistry::new(
            transport,
            timer_tx,
            heartbeat_tx,
            events.clone(),
            &config,
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_event_loop(
            registry,
            frame_rx,
            timer_rx,
            heartbeat_rx,
            command_rx,
            receiver,
        ));

        Ok(LightController {
            commands: command_tx,
            events,
            local_addr: udp.local_addr(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LightEvent> {
        self.events.subscribe()
    }

    /// Stop the event loop, the receive task and every timer.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut DeviceRegistry) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let call: RegistryCall = Box::new(move |registry| {
            let _ = tx.send(f(registry));
        });
        self.commands
            .send(Command::Call(call))
            .map_err(|_| anyhow!("Controller is not running"))?;
        rx.await.context("Controller stopped before answering")
    }

    pub async fn discover(&self) -> Result<CorrelationId> {
        self.call(|registry| registry.start_discovery()).await
    }

    pub async fn discover_by_address(&self, address: SocketAddr) -> Result<HandlerId> {
        self.call(move |registry| registry.discover_by_address(address))
            .await
    }

    pub async fn set_color(
        &self,
        device: DeviceId,
        color: Hsbk,
        duration_ms: u32,
        ack_required: bool,
    ) -> Result<Option<HandlerId>> {
        self.call(move |registry| registry.set_color(device, color, duration_ms, ack_required))
            .await
    }

    pub async fn set_brightness(
        &self,
        device: DeviceId,
        brightness: u16,
        ack_required: bool,
    ) -> Result<Option<HandlerId>> {
        self.call(move |registry| registry.set_brightness(device, brightness, ack_required))
            .await
    }

    pub async fn set_power(&self, device: DeviceId, on: bool) -> Result<Option<HandlerId>> {
        self.call(move |registry| registry.set_power(device, on)).await
    }

    pub async fn set_group_power(&self, group: GroupId, on: bool) -> Result<Vec<HandlerId>> {
        self.call(move |registry| registry.set_group_power(group, on))
            .await
    }

    pub async fn set_group_color(
        &self,
        group: GroupId,
        color: Hsbk,
        duration_ms: u32,
    ) -> Result<Vec<HandlerId>> {
        self.call(move |registry| registry.set_group_color(group, color, duration_ms))
            .await
    }

    pub async fn set_label(&self, device: DeviceId, label: &str) -> Result<Option<HandlerId>> {
        let label = label.to_string();
        self.call(move |registry| registry.set_label(device, &label))
            .await
    }

    pub async fn reboot(&self, device: DeviceId) -> Result<Option<HandlerId>> {
        self.call(move |registry| registry.reboot(device)).await
    }

    pub async fn reboot_group(&self, group: GroupId) -> Result<Vec<HandlerId>> {
        self.call(move |registry| registry.reboot_group(group)).await
    }

    pub async fn refresh_color(&self, device: DeviceId) -> Result<Option<HandlerId>> {
        self.call(move |registry| registry.refresh_color(device)).await
    }

    pub async fn refresh_power(&self, device: DeviceId) -> Result<Option<HandlerId>> {
        self.call(move |registry| registry.refresh_power(device)).await
    }

    pub async fn refresh_all(&self) -> Result<Vec<HandlerId>> {
        self.call(|registry| registry.refresh_all()).await
    }

    pub async fn cancel(&self, handler: HandlerId) -> Result<bool> {
        self.call(move |registry| registry.cancel(handler)).await
    }

    pub async fn enable_heartbeat(&self, device: DeviceId, interval: Duration) -> Result<bool> {
        self.call(move |registry| registry.enable_heartbeat(device, interval))
            .await
    }

    pub async fn disable_heartbeat(&self, device: DeviceId) -> Result<bool> {
        self.call(move |registry| registry.disable_heartbeat(device))
            .await
    }

    pub async fn set_product_capabilities(
        &self,
        table: HashMap<u32, ProductCapabilities>,
    ) -> Result<()> {
        self.call(move |registry| registry.set_product_capabilities(table))
            .await
    }

    pub async fn device(&self, id: DeviceId) -> Result<Option<Device>> {
        self.call(move |registry| registry.device(id).cloned()).await
    }

    pub async fn devices(&self) -> Result<Vec<Device>> {
        self.call(|registry| registry.devices()).await
    }

    pub async fn device_by_label(&self, label: &str) -> Result<Option<Device>> {
        let label = label.to_string();
        self.call(move |registry| registry.device_by_label(&label).cloned())
            .await
    }

    pub async fn devices_by_product(&self, product_id: u32) -> Result<Vec<Device>> {
        self.call(move |registry| registry.devices_by_product(product_id))
            .await
    }

    pub async fn group(&self, id: GroupId) -> Result<Option<Group>> {
        self.call(move |registry| registry.group(id).cloned()).await
    }

    pub async fn group_by_label(&self, label: &str) -> Result<Option<Group>> {
        let label = label.to_string();
        self.call(move |registry| registry.group_by_label(&label).cloned())
            .await
    }

    pub async fn groups(&self) -> Result<Vec<Group>> {
        self.call(|registry| registry.groups()).await
    }
}

async fn run_event_loop(
    mut registry: DeviceRegistry,
    mut frames: mpsc::Receiver<InboundFrame>,
    mut timers: mpsc::UnboundedReceiver<TimerFired>,
    mut heartbeats: mpsc::UnboundedReceiver<DeviceId>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    receiver: JoinHandle<()>,
) {
    debug!("Event loop started");
    loop {
        tokio::select! {
            Some(inbound) = frames.recv() => registry.on_frame(&inbound),
            Some(fired) = timers.recv() => registry.on_timer(fired),
            Some(device) = heartbeats.recv() => registry.on_heartbeat(device),
            command = commands.recv() => match command {
                Some(Command::Call(call)) => call(&mut registry),
                Some(Command::Shutdown) | None => break,
            },
        }
    }
    receiver.abort();
    registry.shutdown();
    info!("Controller stopped");
}
