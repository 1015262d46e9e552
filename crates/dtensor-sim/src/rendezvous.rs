//! Transfer queues shared by every simulated device.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::tensor::Tensor;

/// A host point-to-point channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostChannel {
    pub key: String,
    pub send_device: String,
    pub recv_device: String,
}

impl HostChannel {
    pub fn new(key: &str, send_device: &str, recv_device: &str) -> Self {
        Self {
            key: key.to_string(),
            send_device: send_device.to_string(),
            recv_device: recv_device.to_string(),
        }
    }
}

/// Direction of a host <-> accelerator transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToDevice,
    ToHost,
}

/// A host <-> accelerator channel, addressed by device ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceChannel {
    pub key: String,
    pub ordinal: i64,
    pub direction: Direction,
}

/// FIFO queues of in-flight tensors. Values are delivered in send order per
/// channel.
#[derive(Debug, Default)]
pub struct Rendezvous {
    host: FxHashMap<HostChannel, VecDeque<Tensor>>,
    device: FxHashMap<DeviceChannel, VecDeque<Tensor>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_host(&mut self, channel: HostChannel, value: Tensor) {
        self.host.entry(channel).or_default().push_back(value);
    }

    pub fn recv_host(&mut self, channel: &HostChannel) -> Option<Tensor> {
        self.host.get_mut(channel)?.pop_front()
    }

    pub fn send_device(&mut self, channel: DeviceChannel, value: Tensor) {
        self.device.entry(channel).or_default().push_back(value);
    }

    pub fn recv_device(&mut self, channel: &DeviceChannel) -> Option<Tensor> {
        self.device.get_mut(channel)?.pop_front()
    }

    /// Values queued on one host channel.
    pub fn pending_host(&self, channel: &HostChannel) -> usize {
        self.host.get(channel).map_or(0, VecDeque::len)
    }

    /// Values queued across every channel.
    pub fn pending(&self) -> usize {
        self.host.values().map(VecDeque::len).sum::<usize>()
            + self.device.values().map(VecDeque::len).sum::<usize>()
    }
}
