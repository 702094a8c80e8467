//! End-to-end: the assembled core heals a segment on its own.
//!
//! Starts [`DurabilityCore`] with tight timings over the simulated swarm,
//! kills two nodes, and waits for the checker/queue/repairer pipeline to
//! restore redundancy without any manual driving.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use warden::Backends;
use warden::Config;
use warden::DurabilityCore;
use warden_core::NodeId;
use warden_core::RedundancyScheme;
use warden_metainfo::PointerStore;
use warden_testing::TestSatellite;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn core_heals_injured_segment_unattended() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warden=debug")
        .try_init();

    let sat = TestSatellite::new(7).await;
    let scheme = RedundancyScheme::new(2, 3, 4, 5, 256);
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 233) as u8).collect();
    let (path, _) = sat
        .upload_segment("p/l/b/obj", scheme, &data, &[1, 2, 3, 4, 5])
        .await;

    let backends = Backends {
        overlay: Arc::clone(&sat.overlay_store) as _,
        metainfo: Arc::clone(&sat.metainfo) as _,
        repair_queue: Arc::clone(&sat.queue) as _,
        irreparable: Arc::clone(&sat.irreparable) as _,
        containment: Arc::clone(&sat.containment) as _,
        pieces: Arc::clone(&sat.swarm) as _,
    };
    let core = DurabilityCore::new(sat.satellite_signer(), backends, Config::fast());

    let cancel = CancellationToken::new();
    let core_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { core.run(cancel).await })
    };

    // let a first healthy pass go by, then lose two nodes
    tokio::time::sleep(Duration::from_millis(300)).await;
    sat.set_node_offline(4, true).await;
    sat.set_node_offline(5, true).await;

    // the core must notice, queue, and repair without help
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    let healed = loop {
        if tokio::time::Instant::now() > deadline {
            break false;
        }
        let pointer = sat.metainfo.get(&path).await.unwrap();
        let remote = pointer.remote().unwrap().clone();
        let nodes: Vec<NodeId> = remote.pieces.iter().map(|p| p.node_id).collect();
        let on_dead_nodes = nodes
            .iter()
            .any(|n| *n == TestSatellite::node_id(4) || *n == TestSatellite::node_id(5));
        if !on_dead_nodes && remote.pieces.len() >= 4 {
            break true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    assert!(healed, "core did not repair the segment in time");

    cancel.cancel();
    core_task.await.unwrap();
}
