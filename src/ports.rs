//! NodePort allocation across the four configured ranges.
//!
//! The allocator holds no persistent state: the used-set is derived from the
//! observed services on every call, so a restarted controller reaches the
//! same conclusions as the one it replaced.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Service;
use thiserror::Error;

use crate::config::{PortRange, PortsConfig};

/// Port allocation errors.
#[derive(Debug, Error)]
pub enum PortError {
    /// Every port in the category's range is taken.
    #[error("no free ports available in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

/// A concrete set of NodePorts for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub game: u16,
    pub sourcetv: u16,
    pub client: u16,
    pub steam: u16,
}

/// Collects every positive node-port exposed by the observed services.
pub fn used_node_ports(services: &[Service]) -> BTreeSet<u16> {
    let mut used = BTreeSet::new();
    for service in services {
        let Some(ports) = service.spec.as_ref().and_then(|spec| spec.ports.as_ref()) else {
            continue;
        };
        for port in ports {
            if let Some(node_port) = port.node_port {
                if let Ok(node_port) = u16::try_from(node_port) {
                    if node_port > 0 {
                        used.insert(node_port);
                    }
                }
            }
        }
    }
    used
}

/// Range-aware allocator for the four port categories.
pub struct Allocator {
    ranges: PortsConfig,
}

impl Allocator {
    pub fn new(ranges: PortsConfig) -> Self {
        Self { ranges }
    }

    /// Picks the lowest free port in each range, in fixed category order.
    ///
    /// Each pick is reserved in a local copy of the used-set so the four
    /// returned ports are pairwise distinct even when ranges overlap.
    pub fn allocate(&self, used: &BTreeSet<u16>) -> Result<Assignment, PortError> {
        let mut used = used.clone();
        Ok(Assignment {
            game: next_free(&self.ranges.game, &mut used)?,
            sourcetv: next_free(&self.ranges.sourcetv, &mut used)?,
            client: next_free(&self.ranges.client, &mut used)?,
            steam: next_free(&self.ranges.steam, &mut used)?,
        })
    }
}

fn next_free(range: &PortRange, used: &mut BTreeSet<u16>) -> Result<u16, PortError> {
    for port in range.start..=range.end {
        if used.insert(port) {
            return Ok(port);
        }
    }
    Err(PortError::Exhausted {
        start: range.start,
        end: range.end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    fn test_ranges() -> PortsConfig {
        PortsConfig {
            game: PortRange { start: 30000, end: 30299 },
            sourcetv: PortRange { start: 30300, end: 30599 },
            client: PortRange { start: 40000, end: 40299 },
            steam: PortRange { start: 29000, end: 29299 },
        }
    }

    fn service_with_node_ports(node_ports: &[i32]) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(
                    node_ports
                        .iter()
                        .map(|&node_port| ServicePort {
                            node_port: Some(node_port),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_allocate_empty_cluster_takes_range_starts() {
        let allocator = Allocator::new(test_ranges());
        let assign = allocator.allocate(&BTreeSet::new()).unwrap();
        assert_eq!(assign.game, 30000);
        assert_eq!(assign.sourcetv, 30300);
        assert_eq!(assign.client, 40000);
        assert_eq!(assign.steam, 29000);
    }

    #[test]
    fn test_allocate_skips_used_ports() {
        let allocator = Allocator::new(test_ranges());
        let used = used_node_ports(&[
            service_with_node_ports(&[30000, 30001]),
            service_with_node_ports(&[30300]),
        ]);
        let assign = allocator.allocate(&used).unwrap();
        assert_eq!(assign.game, 30002);
        assert_eq!(assign.sourcetv, 30301);
        assert_eq!(assign.client, 40000);
        assert_eq!(assign.steam, 29000);
    }

    #[test]
    fn test_allocate_exhausted_range() {
        let mut ranges = test_ranges();
        ranges.game = PortRange { start: 30000, end: 30001 };
        let allocator = Allocator::new(ranges);
        let used = used_node_ports(&[service_with_node_ports(&[30000, 30001])]);
        let err = allocator.allocate(&used).unwrap_err();
        assert!(matches!(err, PortError::Exhausted { start: 30000, end: 30001 }));
    }

    #[test]
    fn test_allocate_overlapping_ranges_stay_distinct() {
        let ranges = PortsConfig {
            game: PortRange { start: 30000, end: 30010 },
            sourcetv: PortRange { start: 30000, end: 30010 },
            client: PortRange { start: 30000, end: 30010 },
            steam: PortRange { start: 30000, end: 30010 },
        };
        let assign = Allocator::new(ranges).allocate(&BTreeSet::new()).unwrap();
        let ports = [assign.game, assign.sourcetv, assign.client, assign.steam];
        let distinct: BTreeSet<_> = ports.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_used_node_ports_ignores_unset_and_invalid() {
        let mut service = service_with_node_ports(&[30000, 0, -1, 70000]);
        service
            .spec
            .as_mut()
            .unwrap()
            .ports
            .as_mut()
            .unwrap()
            .push(ServicePort::default());
        let used = used_node_ports(&[service, Service::default()]);
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![30000]);
    }
}
