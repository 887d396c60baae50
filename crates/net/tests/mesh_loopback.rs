//! Mesh bring-up and sync primitives over loopback sockets.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use latticelm_core::graph::{NetConfigBuilder, NodeConfigBuilder, SegmentBuilder, SyncKind, Synchronizer};
use latticelm_core::plan::{ModelDims, PartitionPlan};
use latticelm_core::size::TensorSize;
use latticelm_core::{AlignedBuf, FloatType};
use latticelm_net::{BootstrapPacket, Network, NetworkSynchronizer};

/// Connects the root with retries so worker threads can bind first.
fn connect_with_retry(workers: &[(String, u16)]) -> Network {
    for _ in 0..50 {
        match Network::connect(workers) {
            Ok(network) => return network,
            Err(_) => thread::sleep(Duration::from_millis(50)),
        }
    }
    panic!("could not connect mesh");
}

fn bring_up(base_port: u16, n_workers: usize) -> Vec<Network> {
    let worker_handles: Vec<_> = (0..n_workers)
        .map(|i| {
            let port = base_port + i as u16;
            thread::spawn(move || Network::serve(port).expect("worker mesh"))
        })
        .collect();

    let workers: Vec<(String, u16)> = (0..n_workers)
        .map(|i| ("127.0.0.1".to_string(), base_port + i as u16))
        .collect();
    let root = connect_with_retry(&workers);

    let mut networks = vec![root];
    for handle in worker_handles {
        networks.push(handle.join().unwrap());
    }
    networks
}

#[test]
fn test_mesh_peers_are_addressable_by_node_index() {
    let networks = bring_up(19890, 2);
    let n_nodes = 3u32;

    // Every node writes its own index to every peer, then reads every
    // peer's index from the slot that should hold that peer.
    let handles: Vec<_> = networks
        .into_iter()
        .map(|network| {
            thread::spawn(move || {
                let me = network.node_index();
                for target in 0..n_nodes {
                    if target == me {
                        continue;
                    }
                    network
                        .write(network.socket_index_for_node(target), &me.to_le_bytes())
                        .unwrap();
                }
                for target in 0..n_nodes {
                    if target == me {
                        continue;
                    }
                    let mut buf = [0u8; 4];
                    network
                        .read(network.socket_index_for_node(target), &mut buf)
                        .unwrap();
                    assert_eq!(
                        u32::from_le_bytes(buf),
                        target,
                        "node {me} read wrong peer at slot for node {target}"
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_bootstrap_packet_roundtrip_over_socket() {
    let networks = bring_up(19920, 1);
    let mut iter = networks.into_iter();
    let root = iter.next().unwrap();
    let worker = iter.next().unwrap();

    let sent = BootstrapPacket {
        benchmark_enabled: true,
        max_seq_len: 4096,
        sync_type: 3,
        model_path: Some("/models/tiny.lm".to_string()),
        ratios: Some("1:2*1:1*2:3".to_string()),
    };
    let handle = {
        let sent = sent.clone();
        thread::spawn(move || {
            sent.write_to(&root, 0).unwrap();
            root
        })
    };
    let received = BootstrapPacket::read_from(&worker, 0).unwrap();
    assert_eq!(received, sent);
    handle.join().unwrap();
}

#[test]
fn test_stop_packet_is_idempotent() {
    use latticelm_net::ControlPacket;

    let networks = bring_up(19960, 1);
    let mut iter = networks.into_iter();
    let root = iter.next().unwrap();
    let worker = iter.next().unwrap();

    // The root may send the stop packet more than once; the worker
    // exits its control loop on the first one.
    root.write_to_all(&ControlPacket::stop().encode()).unwrap();
    root.write_to_all(&ControlPacket::stop().encode()).unwrap();

    let mut buf = [0u8; ControlPacket::WIRE_SIZE];
    worker.read(0, &mut buf).unwrap();
    assert!(ControlPacket::decode(&buf).is_stop());
}

#[test]
fn test_node_slices_all_gather() {
    let n_nodes = 3usize;
    let networks = bring_up(19940, n_nodes - 1);

    let dims = ModelDims {
        n_layers: 3,
        n_heads: 12,
        n_kv_heads: 12,
        vocab_size: 960,
        ffn_dim: 96,
        dim: 96,
    };
    let plan = Arc::new(PartitionPlan::uniform(n_nodes as u32, dims).unwrap());

    // One pipe whose row matches the vocab split: 960 f32 entries.
    let mut net_builder = NetConfigBuilder::new(n_nodes as u32, 1);
    let pipe = net_builder.add_pipe("LG", TensorSize::d2(FloatType::F32, 1, 960));
    let net_config = net_builder.build();

    let handles: Vec<_> = networks
        .into_iter()
        .map(|network| {
            let plan = Arc::clone(&plan);
            let net_config = net_config.clone();
            thread::spawn(move || {
                let me = network.node_index();
                let node_config = {
                    let mut builder = NodeConfigBuilder::new(me);
                    let mut segment = SegmentBuilder::new();
                    segment.add_sync(pipe, SyncKind::NodeSlices);
                    builder.add_segment(segment.build());
                    builder.build()
                };

                let mut pipes = vec![AlignedBuf::zeroed(net_config.pipes[0].size.n_bytes)];
                let per_node = plan.vocab_split.lengths[me as usize] as usize;
                let start = plan.vocab_split.starts[me as usize] as usize;
                {
                    let floats = unsafe {
                        std::slice::from_raw_parts_mut(
                            pipes[0].as_ptr() as *mut f32,
                            960,
                        )
                    };
                    for i in 0..per_node {
                        floats[start + i] = (me * 1000 + i as u32) as f32;
                    }
                }

                let mut synchronizer = NetworkSynchronizer::new(
                    Arc::new(network),
                    net_config.clone(),
                    &node_config,
                    Some(plan.clone()),
                );
                synchronizer
                    .sync_segment(&node_config.segments[0], &mut pipes, 1)
                    .unwrap();

                // Every node must now hold the ordered concatenation of
                // all slices.
                let floats = unsafe {
                    std::slice::from_raw_parts(pipes[0].as_ptr() as *const f32, 960)
                };
                for node in 0..3u32 {
                    let node_start = plan.vocab_split.starts[node as usize] as usize;
                    let node_len = plan.vocab_split.lengths[node as usize] as usize;
                    for i in 0..node_len {
                        assert_eq!(
                            floats[node_start + i],
                            (node * 1000 + i as u32) as f32,
                            "node {me}: wrong value in slice of node {node}"
                        );
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
