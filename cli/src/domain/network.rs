//! Planning for the interface save/restore around the isolated build network.
//!
//! Pure functions: the steps feed in what the hypervisor reported and apply
//! the returned actions in order.

/// Interface index reserved for host-to-guest management traffic.
pub const MANAGEMENT_DEVICE: u32 = 0;

/// One restoration action for interface index `device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreAction<N> {
    /// Nothing was remembered for this index.
    Skip { device: u32 },
    /// Remove whatever sits at `device` (if anything) and plug `network` back in.
    Reconnect {
        device: u32,
        network: N,
        remove_existing: bool,
    },
}

/// Devices that get the isolated network while the build runs.
///
/// Every interface that had a network, except the management one, is
/// re-plugged, so the guest keeps its interfaces but cannot reach the
/// networks the source VM was on.
#[must_use]
pub fn isolated_devices<N>(originals: &[Option<N>]) -> Vec<u32> {
    originals
        .iter()
        .enumerate()
        .filter(|(_, original)| original.is_some())
        .filter_map(|(i, _)| u32::try_from(i).ok())
        .filter(|d| *d != MANAGEMENT_DEVICE)
        .collect()
}

/// Lay out interfaces by device index, leaving `None` where a device number
/// is unused.
#[must_use]
pub fn networks_by_device<N: Clone>(interfaces: &[(u32, N)]) -> Vec<Option<N>> {
    let len = interfaces
        .iter()
        .map(|(device, _)| *device as usize + 1)
        .max()
        .unwrap_or(0);
    let mut slots = vec![None; len];
    for (device, network) in interfaces {
        slots[*device as usize] = Some(network.clone());
    }
    slots
}

/// Map remembered networks back onto interface indices.
///
/// `originals[i]` is the network that was on device `i` before the build;
/// `None` entries are skipped. `occupied` lists the devices that currently
/// carry an interface, which must be removed before reconnecting.
#[must_use]
pub fn plan_restore<N: Clone>(originals: &[Option<N>], occupied: &[u32]) -> Vec<RestoreAction<N>> {
    originals
        .iter()
        .enumerate()
        .filter_map(|(i, original)| u32::try_from(i).ok().map(|device| (device, original)))
        .map(|(device, original)| match original {
            None => RestoreAction::Skip { device },
            Some(network) => RestoreAction::Reconnect {
                device,
                network: network.clone(),
                remove_existing: occupied.contains(&device),
            },
        })
        .collect()
}
