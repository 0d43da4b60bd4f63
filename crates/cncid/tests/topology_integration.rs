//! End-to-end topology scenarios against the in-memory host

use std::sync::Arc;

use cnci_common::CnciError;
use cnci_test::{ip, neighbor, ready_concentrator, subnet, FakeDhcp, FakeKernel};
use cncid::concentrator::Concentrator;
use cncid::kernel::NetKernel;
use cncid::types::{LinkKind, PEER_TUNNEL_NAME};

#[tokio::test]
async fn test_add_then_duplicate_add() {
    let (kernel, dhcp, cnci) = ready_concentrator().await;

    let first = cnci
        .add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();
    let bridge_name = first.expect("new bridge must be reported");

    assert!(cnci.topology().has_link("br_192.168.8.0+21"));
    assert!(cnci.topology().has_link("gre_192.168.8.0+21##10.0.0.5"));
    assert!(kernel.link_with_alias("br_192.168.8.0+21").is_some());
    assert!(dhcp.is_running("br_192.168.8.0+21"));

    let creates = kernel.op_count("bridge_create") + kernel.op_count("gretap_create");
    let enables = kernel.op_count("link_enable");
    assert_eq!(creates, 2);
    assert_eq!(enables, 2);

    let second = cnci
        .add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(second.as_deref(), Some(bridge_name.as_str()));

    // No kernel mutations beyond the (idempotent) attach.
    assert_eq!(
        kernel.op_count("bridge_create") + kernel.op_count("gretap_create"),
        creates
    );
    assert_eq!(kernel.op_count("link_enable"), enables);
    assert_eq!(kernel.op_count("link_attach"), 2);
}

#[tokio::test]
async fn test_existing_bridge_new_tunnel_returns_none() {
    let (_kernel, _dhcp, cnci) = ready_concentrator().await;

    let first = cnci
        .add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();
    assert!(first.is_some());

    // Same subnet, different compute node: the bridge already exists, so
    // the caller gets no name back even though the call succeeded.
    let second = cnci
        .add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.6"))
        .await
        .unwrap();
    assert!(second.is_none());

    assert_eq!(
        cnci.topology().bridge_refcount("br_192.168.8.0+21"),
        Some(2)
    );
}

#[tokio::test]
async fn test_concurrent_add_of_same_subnet() {
    let (kernel, _dhcp, cnci) = ready_concentrator().await;
    let cnci = Arc::new(cnci);

    let a = {
        let cnci = cnci.clone();
        tokio::spawn(async move {
            cnci.add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
                .await
        })
    };
    let b = {
        let cnci = cnci.clone();
        tokio::spawn(async move {
            cnci.add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
                .await
        })
    };

    let first = a.await.unwrap().unwrap().expect("bridge name");
    let second = b.await.unwrap().unwrap().expect("bridge name");

    // Exactly one creation happened and both callers agree on its name.
    assert_eq!(first, second);
    assert_eq!(kernel.op_count("bridge_create"), 1);
    assert_eq!(kernel.op_count("gretap_create"), 1);
    assert_eq!(cnci.topology().name_count(), 2);
}

#[tokio::test]
async fn test_add_then_del() {
    let (kernel, dhcp, cnci) = ready_concentrator().await;

    cnci.add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();
    let gre_name = kernel
        .link_with_alias("gre_192.168.8.0+21##10.0.0.5")
        .unwrap()
        .name;

    cnci.del_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();

    assert!(!cnci.topology().has_link("gre_192.168.8.0+21##10.0.0.5"));
    assert!(kernel.link(&gre_name).is_none());

    // Bridge and DHCP survive instance churn.
    assert!(cnci.topology().has_link("br_192.168.8.0+21"));
    assert_eq!(
        cnci.topology().bridge_refcount("br_192.168.8.0+21"),
        Some(0)
    );
    assert!(dhcp.is_running("br_192.168.8.0+21"));
}

#[tokio::test]
async fn test_del_of_absent_tunnel_is_idempotent() {
    let (kernel, _dhcp, cnci) = ready_concentrator().await;

    cnci.del_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(kernel.op_count("link_destroy"), 0);
}

#[tokio::test]
async fn test_add_validation_errors() {
    let (_kernel, _dhcp, cnci) = ready_concentrator().await;

    let err = cnci
        .add_remote_subnet(subnet("192.168.8.0/21"), 0, ip("10.0.0.5"))
        .await
        .unwrap_err();
    assert!(matches!(err, CnciError::InvalidInput { ref field, .. } if field == "subnet_key"));

    let err = cnci
        .add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("0.0.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, CnciError::InvalidInput { ref field, .. } if field == "peer_ip"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_bridge_create_failure_is_retryable() {
    let (kernel, _dhcp, cnci) = ready_concentrator().await;

    kernel.fail_on("bridge_create", None);
    let err = cnci
        .add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // The failed reservation released its gate and rolled the tunnel back.
    assert!(!cnci.topology().has_link("gre_192.168.8.0+21##10.0.0.5"));
    assert_eq!(
        cnci.topology().bridge_refcount("br_192.168.8.0+21"),
        Some(0)
    );

    kernel.clear_failures();
    let retried = cnci
        .add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();
    assert!(retried.is_some());
    assert_eq!(
        cnci.topology().bridge_refcount("br_192.168.8.0+21"),
        Some(1)
    );
}

#[tokio::test]
async fn test_update_neighbors_three_then_two() {
    let (kernel, _dhcp, cnci) = ready_concentrator().await;

    let local = neighbor("10.0.0.1", "172.16.0.0/24", "192.168.0.1", 7);
    let three = vec![
        local.clone(),
        neighbor("10.0.0.7", "172.16.1.0/24", "192.168.0.2", 7),
        neighbor("10.0.0.8", "172.16.2.0/24", "192.168.0.3", 7),
        neighbor("10.0.0.9", "172.16.3.0/24", "192.168.0.4", 7),
    ];

    cnci.update_neighbors(&three).await.unwrap();

    let tun = kernel.link(PEER_TUNNEL_NAME).expect("peer tunnel exists");
    assert_eq!(tun.kind, LinkKind::GreTun);
    assert_eq!(
        kernel.addrs(PEER_TUNNEL_NAME),
        vec![subnet("192.168.0.1/18")]
    );

    let neighbors = kernel.neighbors(PEER_TUNNEL_NAME);
    assert_eq!(neighbors.len(), 3);
    assert!(neighbors.iter().all(|n| n.permanent));
    // One host route and one subnet route per peer.
    assert_eq!(kernel.routes().len(), 6);

    // Same list again: converged, nothing to do.
    let adds = kernel.op_count("neigh_add");
    cnci.update_neighbors(&three).await.unwrap();
    assert_eq!(kernel.op_count("neigh_add"), adds);
    assert_eq!(kernel.op_count("neigh_del"), 0);

    // Drop the last peer.
    let two = vec![
        local,
        neighbor("10.0.0.7", "172.16.1.0/24", "192.168.0.2", 7),
        neighbor("10.0.0.8", "172.16.2.0/24", "192.168.0.3", 7),
    ];
    cnci.update_neighbors(&two).await.unwrap();

    let neighbors = kernel.neighbors(PEER_TUNNEL_NAME);
    assert_eq!(neighbors.len(), 2);
    assert!(!neighbors.iter().any(|n| n.dst == ip("192.168.0.4")));

    let routes = kernel.routes();
    assert_eq!(routes.len(), 4);
    assert!(!routes.iter().any(|r| r.dst == subnet("192.168.0.4/32")));
    assert!(!routes.iter().any(|r| r.via == Some(ip("192.168.0.4"))));
}

#[tokio::test]
async fn test_update_neighbors_repairs_tunnel_address() {
    let (kernel, _dhcp, cnci) = ready_concentrator().await;

    let peers = vec![
        neighbor("10.0.0.1", "172.16.0.0/24", "192.168.0.1", 7),
        neighbor("10.0.0.7", "172.16.1.0/24", "192.168.0.2", 7),
    ];
    cnci.update_neighbors(&peers).await.unwrap();

    // A stray address appears on the tunnel; the next call removes it.
    kernel
        .addr_add(PEER_TUNNEL_NAME, &subnet("192.168.64.1/18"))
        .await
        .unwrap();
    cnci.update_neighbors(&peers).await.unwrap();

    assert_eq!(
        kernel.addrs(PEER_TUNNEL_NAME),
        vec![subnet("192.168.0.1/18")]
    );
}

#[tokio::test]
async fn test_update_neighbors_without_local_entry() {
    let (_kernel, _dhcp, cnci) = ready_concentrator().await;

    let err = cnci
        .update_neighbors(&[neighbor("10.0.0.7", "172.16.1.0/24", "192.168.0.2", 7)])
        .await
        .unwrap_err();
    assert!(matches!(err, CnciError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_rebuild_after_crash() {
    let kernel = Arc::new(FakeKernel::new());
    kernel.seed_physical("eth0", &["10.0.0.1/24"]);
    // Devices left behind by a previous process.
    kernel.seed_link("cncibr01", "br_10.1.0.0+24", LinkKind::Bridge);
    kernel.seed_link("cncigt01", "gre_10.1.0.0+24##10.0.0.7", LinkKind::GreTap);

    let dhcp = Arc::new(FakeDhcp::new());
    let cnci = Concentrator::new(cnci_test::test_config(), kernel.clone(), dhcp.clone());
    cnci.init().await.unwrap();

    let topo = cnci.topology();
    assert_eq!(topo.link_count(), 2);
    assert_eq!(topo.bridge_count(), 1);
    assert_eq!(topo.name_count(), 2);
    assert_eq!(topo.bridge_refcount("br_10.1.0.0+24"), Some(1));
    assert!(topo.has_name("cncibr01"));
    assert!(topo.has_name("cncigt01"));
    assert!(dhcp.is_running("br_10.1.0.0+24"));

    // The recovered tunnel is fully operational.
    cnci.del_remote_subnet(subnet("10.1.0.0/24"), 99, ip("10.0.0.7"))
        .await
        .unwrap();
    assert!(kernel.link("cncigt01").is_none());
    assert_eq!(topo.bridge_refcount("br_10.1.0.0+24"), Some(0));
}

#[tokio::test]
async fn test_rebuild_orphan_tunnel_is_fatal() {
    let kernel = Arc::new(FakeKernel::new());
    kernel.seed_physical("eth0", &["10.0.0.1/24"]);
    kernel.seed_link("cncigt01", "gre_10.1.0.0+24##10.0.0.7", LinkKind::GreTap);

    let dhcp = Arc::new(FakeDhcp::new());
    let cnci = Concentrator::new(cnci_test::test_config(), kernel, dhcp);
    let err = cnci.init().await.unwrap_err();
    assert!(matches!(err, CnciError::Inconsistent { .. }));
}

#[tokio::test]
async fn test_shutdown_destroys_everything() {
    let (kernel, dhcp, cnci) = ready_concentrator().await;

    cnci.add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();

    cnci.shutdown().await.unwrap();

    let topo = cnci.topology();
    assert_eq!(topo.link_count(), 0);
    assert_eq!(topo.bridge_count(), 0);
    assert_eq!(topo.name_count(), 0);
    assert_eq!(dhcp.running_count(), 0);
    assert!(kernel.link_with_alias("br_192.168.8.0+21").is_none());
    assert!(kernel
        .link_with_alias("gre_192.168.8.0+21##10.0.0.5")
        .is_none());
}

#[tokio::test]
async fn test_shutdown_keeps_going_past_failures() {
    let (kernel, dhcp, cnci) = ready_concentrator().await;

    cnci.add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();
    let bridge_name = kernel.link_with_alias("br_192.168.8.0+21").unwrap().name;
    let gre_name = kernel
        .link_with_alias("gre_192.168.8.0+21##10.0.0.5")
        .unwrap()
        .name;

    kernel.fail_on("link_destroy", Some(&gre_name));
    let err = cnci.shutdown().await.unwrap_err();
    assert!(matches!(err, CnciError::Kernel { .. }));

    // The bridge teardown still ran and the store is drained.
    assert!(kernel.link(&bridge_name).is_none());
    assert_eq!(cnci.topology().link_count(), 0);
    assert_eq!(dhcp.running_count(), 0);
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let (kernel, _dhcp, cnci) = ready_concentrator().await;

    let forwarding = kernel.op_count("enable_forwarding");
    cnci.init().await.unwrap();
    assert_eq!(kernel.op_count("enable_forwarding"), forwarding);
}

#[tokio::test]
async fn test_init_fails_with_ambiguous_interfaces() {
    let kernel = Arc::new(FakeKernel::new());
    kernel.seed_physical("eth0", &["10.0.0.1/24"]);
    kernel.seed_physical("eth1", &["10.1.0.1/24"]);

    let dhcp = Arc::new(FakeDhcp::new());
    let cnci = Concentrator::new(cnci_test::test_config(), kernel, dhcp);
    let err = cnci.init().await.unwrap_err();
    assert!(matches!(err, CnciError::Config { .. }));
}

#[tokio::test]
async fn test_store_invariants_across_operations() {
    let (kernel, _dhcp, cnci) = ready_concentrator().await;

    cnci.add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.5"))
        .await
        .unwrap();
    cnci.add_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.6"))
        .await
        .unwrap();
    cnci.add_remote_subnet(subnet("10.2.0.0/24"), 43, ip("10.0.0.5"))
        .await
        .unwrap();

    let topo = cnci.topology();
    // Every link owns a distinct reserved name.
    assert_eq!(topo.link_count(), 5);
    assert_eq!(topo.name_count(), 5);
    // Refcounts match the number of tunnels per bridge.
    assert_eq!(topo.bridge_refcount("br_192.168.8.0+21"), Some(2));
    assert_eq!(topo.bridge_refcount("br_10.2.0.0+24"), Some(1));

    cnci.del_remote_subnet(subnet("192.168.8.0/21"), 42, ip("10.0.0.6"))
        .await
        .unwrap();
    assert_eq!(topo.bridge_refcount("br_192.168.8.0+21"), Some(1));
    assert_eq!(topo.link_count(), 4);
    assert_eq!(topo.name_count(), 4);
    assert_eq!(kernel.op_count("link_destroy"), 1);
}
