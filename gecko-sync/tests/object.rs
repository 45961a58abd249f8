mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use gecko_sync::{
    frame::{DataProxy, FrameData},
    object, Version,
};

#[tokio::test(flavor = "multi_thread")]
async fn sessions_mapped_by_name_and_id() {
    let a = listening_node().await;
    let b = listening_node().await;
    let c = listening_node().await;
    let a_from_b = connect(&b, &a).await;
    let a_from_c = connect(&c, &a).await;

    let slave = b.map_session(&a_from_b, "nbody").await.unwrap();
    assert!(!slave.is_master());
    let master = a
        .map_session(&a.self_node().unwrap(), "nbody")
        .await
        .unwrap();
    assert!(master.is_master());
    assert_eq!(master.id(), slave.id());
    // 已映射的会话直接返回
    assert_eq!(
        b.map_session(&a_from_b, "nbody").await.unwrap().id(),
        slave.id()
    );

    let by_id = c.map_session_by_id(&a_from_c, master.id()).await.unwrap();
    assert_eq!(by_id.name(), "nbody");
    assert!(c
        .map_session_by_id(&a_from_c, master.id().wrapping_add(1))
        .await
        .is_err());

    c.stop_listening().await.unwrap();
    b.stop_listening().await.unwrap();
    a.stop_listening().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn slave_ids_come_from_master() {
    let a = listening_node().await;
    let b = listening_node().await;
    let a_proxy = connect(&b, &a).await;

    let slave = b.map_session(&a_proxy, "ids").await.unwrap();
    let master = a.session(slave.id()).unwrap();
    assert_eq!(master.gen_ids(3).await.unwrap(), 1);
    assert_eq!(slave.gen_ids(2).await.unwrap(), 4);
    assert_eq!(master.gen_ids(1).await.unwrap(), 6);

    b.stop_listening().await.unwrap();
    a.stop_listening().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_and_sync_across_nodes() {
    let a = listening_node().await;
    let b = listening_node().await;
    let a_proxy = connect(&b, &a).await;

    let b_session = b.map_session(&a_proxy, "objects").await.unwrap();
    let a_session = a.session(b_session.id()).unwrap();
    let master = a_session.register_master(Counter(10)).await.unwrap();
    assert_eq!(master.version().await, Version::FIRST);

    let mut slave = b_session
        .map_object(master.id(), &a_proxy, Counter::default())
        .await
        .unwrap();
    assert_eq!(slave.version(), Version::FIRST);
    assert_eq!(slave.data(), &Counter(10));
    assert_eq!(master.slave_count().await, 1);

    let mut versions = Vec::new();
    for value in 11..14 {
        master.update(|counter| counter.0 = value).await;
        versions.push(master.commit().await);
    }
    assert_eq!(versions, vec![Version(2), Version(3), Version(4)]);

    assert_eq!(
        slave.sync(Version(3), Some(TIMEOUT)).await.unwrap(),
        Version(3)
    );
    assert_eq!(slave.data(), &Counter(12));
    // 旧版本立即返回，不消费队列
    assert_eq!(
        slave.sync(Version(2), Some(TIMEOUT)).await.unwrap(),
        Version(3)
    );
    assert_eq!(
        slave.sync(Version(4), Some(TIMEOUT)).await.unwrap(),
        Version(4)
    );
    assert_eq!(slave.data(), &Counter(13));

    assert!(matches!(
        slave
            .sync(Version(5), Some(Duration::from_millis(100)))
            .await,
        Err(object::Error::Timeout)
    ));

    b.stop_listening().await.unwrap();
    a.stop_listening().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_head_drains_received_versions() {
    let a = listening_node().await;
    let b = listening_node().await;
    let a_proxy = connect(&b, &a).await;

    let b_session = b.map_session(&a_proxy, "head").await.unwrap();
    let a_session = a.session(b_session.id()).unwrap();
    let master = a_session.register_master(Counter(0)).await.unwrap();
    let mut slave = b_session
        .map_object(master.id(), &a_proxy, Counter::default())
        .await
        .unwrap();

    assert_eq!(slave.sync_head().unwrap(), Version::FIRST);
    for value in 1..=5 {
        master.update(|counter| counter.0 = value).await;
        master.commit().await;
    }
    wait_until(|| slave.head_version() == Version(6)).await;
    assert_eq!(slave.version(), Version::FIRST);
    assert_eq!(slave.sync_head().unwrap(), Version(6));
    assert_eq!(slave.data(), &Counter(5));

    b.stop_listening().await.unwrap();
    a.stop_listening().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn master_disconnect_wakes_sync() {
    let a = listening_node().await;
    let b = listening_node().await;
    let a_proxy = connect(&b, &a).await;

    let b_session = b.map_session(&a_proxy, "disconnect").await.unwrap();
    let a_session = a.session(b_session.id()).unwrap();
    let master = a_session.register_master(Counter(0)).await.unwrap();
    let mut slave = b_session
        .map_object(master.id(), &a_proxy, Counter::default())
        .await
        .unwrap();

    let waiter = tokio::spawn(async move { slave.sync(Version(100), None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.stop_listening().await.unwrap();

    let res = tokio::time::timeout(TIMEOUT, waiter).await.unwrap().unwrap();
    assert!(matches!(res, Err(object::Error::MasterDisconnected)));
    b.stop_listening().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unmapped_slave_stops_receiving() {
    let a = listening_node().await;
    let b = listening_node().await;
    let a_proxy = connect(&b, &a).await;

    let b_session = b.map_session(&a_proxy, "unmap").await.unwrap();
    let a_session = a.session(b_session.id()).unwrap();
    let master = a_session.register_master(Counter(0)).await.unwrap();
    let slave = b_session
        .map_object(master.id(), &a_proxy, Counter::default())
        .await
        .unwrap();
    assert_eq!(master.slave_count().await, 1);

    slave.unmap().await.unwrap();
    for _ in 0..100 {
        if master.slave_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(master.slave_count().await, 0);
    // 没有从对象时提交仍然推进版本
    assert_eq!(master.commit().await, Version(2));

    b.stop_listening().await.unwrap();
    a.stop_listening().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remap_while_master_busy_keeps_order() {
    // 重新派发只由新报文触发
    let mut slow = config();
    slow.node.redispatch_interval_ms = 1000;
    let a = listening_node_with(slow, Arc::new(gecko_sync::HookNoop)).await;
    let b = listening_node().await;
    let a_proxy = connect(&b, &a).await;

    let b_session = b.map_session(&a_proxy, "remap").await.unwrap();
    let a_session = a.session(b_session.id()).unwrap();
    let master = a_session.register_master(Counter(1)).await.unwrap();
    let slave = b_session
        .map_object(master.id(), &a_proxy, Counter::default())
        .await
        .unwrap();

    // 主对象被占用期间到达的取消订阅会被暂缓
    let held = master.clone();
    let holder = tokio::spawn(async move {
        held.read(|_| std::thread::sleep(Duration::from_millis(300)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    slave.unmap().await.unwrap();
    holder.await.unwrap();

    // 新的订阅不能越过暂缓的取消订阅
    let mut slave = b_session
        .map_object(master.id(), &a_proxy, Counter::default())
        .await
        .unwrap();
    assert_eq!(slave.data(), &Counter(1));
    assert_eq!(master.slave_count().await, 1);

    master.update(|counter| counter.0 = 5).await;
    assert_eq!(master.commit().await, Version(2));
    assert_eq!(
        slave.sync(Version(2), Some(TIMEOUT)).await.unwrap(),
        Version(2)
    );
    assert_eq!(slave.data(), &Counter(5));

    b.stop_listening().await.unwrap();
    a.stop_listening().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn mapping_unknown_or_local_object_fails() {
    let a = listening_node().await;
    let b = listening_node().await;
    let a_proxy = connect(&b, &a).await;

    let b_session = b.map_session(&a_proxy, "missing").await.unwrap();
    assert!(matches!(
        b_session
            .map_object(42, &a_proxy, Counter::default())
            .await,
        Err(object::Error::NotFound(42))
    ));

    let a_session = a.session(b_session.id()).unwrap();
    let master = a_session.register_master(Counter(0)).await.unwrap();
    assert!(matches!(
        a_session
            .map_object(master.id(), &a.self_node().unwrap(), Counter::default())
            .await,
        Err(object::Error::MapOnMaster)
    ));

    b.stop_listening().await.unwrap();
    a.stop_listening().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn frame_data_follows_proxies() {
    let a = listening_node().await;
    let b = listening_node().await;
    let a_proxy = connect(&b, &a).await;

    let b_session = b.map_session(&a_proxy, "frame").await.unwrap();
    let a_session = a.session(b_session.id()).unwrap();

    let mut frame = FrameData::new();
    frame.init(8);
    frame.init_host_data();
    frame.update_parameters(1.5, 2.0, 0.016);
    frame.add_proxy_id(1, 0.0, 0.5).unwrap();
    frame.add_proxy_id(2, 0.5, 1.0).unwrap();
    let master = a_session.register_master(frame).await.unwrap();
    let mut slave = b_session
        .map_object(master.id(), &a_proxy, FrameData::new())
        .await
        .unwrap();
    assert_eq!(slave.data().num_bodies(), 8);
    assert!(slave.data().new_parameters());
    assert!(slave.data().is_ready());

    // 提交后区间清零，需要所有代理重新报告
    master.commit().await;
    assert!(!master.read(FrameData::is_ready).await);

    let mut low = DataProxy::new(1, 0.0, 0.5, 8).unwrap();
    low.positions_mut().fill(3.0);
    let high = DataProxy::new(2, 0.5, 1.0, 8).unwrap();
    master
        .update(|frame| {
            assert!(frame.update_from_proxy(&low, Version(2)));
            assert!(frame.update_from_proxy(&high, Version(2)));
        })
        .await;
    assert!(master.read(FrameData::is_ready).await);
    let version = master.commit().await;

    slave.sync(version, Some(TIMEOUT)).await.unwrap();
    assert_eq!(&slave.data().positions()[..16], &[3.0; 16]);
    assert_eq!(slave.data().version_for_proxy_id(1), Version(2));
    assert!(slave.data().is_ready());

    b.stop_listening().await.unwrap();
    a.stop_listening().await.unwrap();
}
