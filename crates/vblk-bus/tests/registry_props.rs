use std::collections::HashSet;

use proptest::prelude::*;
use vblk_bus::registry::{BusNode, NodeRegistry};
use vblk_bus::{DeviceRef, DiskKind};

#[derive(Debug, Clone)]
enum Op {
    LinkNew { boot: bool },
    Link { unit: u32 },
    Unlink { pick: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<bool>().prop_map(|boot| Op::LinkNew { boot }),
        (0u32..8).prop_map(|unit| Op::Link { unit }),
        any::<usize>().prop_map(|pick| Op::Unlink { pick }),
    ]
}

fn disk() -> DeviceRef {
    DeviceRef::new("prop", DiskKind::Dummy { size_bytes: 512 })
}

proptest! {
    #[test]
    fn count_matches_linked_nodes_and_units_stay_unique(ops in prop::collection::vec(op(), 0..64)) {
        let reg = NodeRegistry::new();
        let mut model: Vec<(u32, DeviceRef)> = Vec::new();

        for op in ops {
            match op {
                Op::LinkNew { boot } => {
                    let device = disk();
                    let unit = reg.link_new(device.clone(), boot).unwrap();
                    prop_assert!(model.iter().all(|(u, _)| *u != unit));
                    model.push((unit, device));
                }
                Op::Link { unit } => {
                    let device = disk();
                    let taken = model.iter().any(|(u, _)| *u == unit);
                    let linked = reg.link(BusNode::new(unit, device.clone(), false));
                    prop_assert_eq!(linked.is_ok(), !taken);
                    if !taken {
                        model.push((unit, device));
                    }
                }
                Op::Unlink { pick } => {
                    if model.is_empty() {
                        continue;
                    }
                    let (unit, device) = model.remove(pick % model.len());
                    let node = reg.unlink(&device).expect("linked node unlinks");
                    prop_assert_eq!(node.unit(), unit);
                    prop_assert!(!node.is_linked());
                    prop_assert!(reg.unlink(&device).is_none());
                }
            }

            let nodes = reg.lock();
            prop_assert_eq!(nodes.count(), model.len());
            prop_assert_eq!(nodes.iter().count(), model.len());
            prop_assert!(nodes.iter().all(BusNode::is_linked));
            let units: HashSet<u32> = nodes.iter().map(BusNode::unit).collect();
            prop_assert_eq!(units.len(), model.len());
        }
    }
}
