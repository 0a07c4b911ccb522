//! Slab migration off bad and reused hosts

mod common;

use common::{contracts, host_key, sample, test_config, Cluster};
use std::collections::HashSet;
use tessera_core::{RedundancySettings, Slab, SlabSlice};
use tessera_worker::{MigrationStep, SlabError, SlabWorker};

const DATA_LEN: usize = 150_000;

async fn upload(worker: &SlabWorker, hosts: &[u8]) -> Slab {
    let redundancy = RedundancySettings::new(2, hosts.len()).unwrap();
    worker
        .upload_slab(&mut sample(DATA_LEN).as_slice(), redundancy, &contracts(hosts))
        .await
        .unwrap()
        .slab
}

async fn read_back(worker: &SlabWorker, slab: &Slab, hosts: &[u8]) -> Vec<u8> {
    let slice = SlabSlice::new(slab.clone(), 0, DATA_LEN as u32).unwrap();
    let mut out = Vec::new();
    worker
        .download_slab(&mut out, &slice, &contracts(hosts))
        .await
        .unwrap();
    out
}

#[tokio::test]
async fn test_migrate_off_lost_host() {
    let cluster = Cluster::new(4);
    let worker = cluster.worker(test_config());
    let mut slab = upload(&worker, &[1, 2, 3, 4]).await;
    let before = slab.clone();

    cluster.provider.remove_host(&host_key(3));
    cluster.add_host(5);
    let good = [1, 2, 4, 5];

    let migrated = worker.migrate_slab(&mut slab, &contracts(&good)).await.unwrap();
    assert_eq!(migrated, vec![2]);

    // the shard moved with identical contents, the rest stayed put
    assert_eq!(slab.shards[2].host, host_key(5));
    assert_eq!(slab.shards[2].root, before.shards[2].root);
    assert!(cluster.host(5).has_sector(&slab.shards[2].root));
    for i in [0, 1, 3] {
        assert_eq!(slab.shards[i], before.shards[i]);
    }
    assert_eq!(slab.key, before.key);

    let good_hosts: HashSet<_> = good.into_iter().map(host_key).collect();
    assert!(slab.is_healthy(&good_hosts));

    // readable through the new host alone with one original
    cluster.host(1).set_offline(true);
    cluster.host(2).set_offline(true);
    assert_eq!(read_back(&worker, &slab, &good).await, sample(DATA_LEN));
}

#[tokio::test]
async fn test_migrate_healthy_slab_is_noop() {
    let cluster = Cluster::new(5);
    let worker = cluster.worker(test_config());
    let mut slab = upload(&worker, &[1, 2, 3, 4]).await;

    let candidates = contracts(&[1, 2, 3, 4, 5]);
    cluster.host(4).set_offline(true);
    let before = slab.clone();
    // first run moves the shard off host 4 once it is dropped from the set
    let migrated = worker
        .migrate_slab(&mut slab, &contracts(&[1, 2, 3, 5]))
        .await
        .unwrap();
    assert_eq!(migrated, vec![3]);
    assert_ne!(slab, before);

    let uploads = cluster.host(5).stats().uploads;
    let acquired = cluster.locker.stats().acquired;
    let again = worker
        .migrate_slab(&mut slab, &contracts(&[1, 2, 3, 5]))
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(cluster.host(5).stats().uploads, uploads);
    assert_eq!(cluster.locker.stats().acquired, acquired);

    // a superset of good hosts changes nothing either
    let untouched = slab.clone();
    cluster.host(4).set_offline(false);
    assert!(worker.migrate_slab(&mut slab, &candidates).await.unwrap().is_empty());
    assert_eq!(slab, untouched);
}

#[tokio::test]
async fn test_migrate_reused_host() {
    let cluster = Cluster::new(5);
    let worker = cluster.worker(test_config());
    let mut slab = upload(&worker, &[1, 2, 3, 4]).await;
    let original_root = slab.shards[2].root;

    // shard 2 recorded on host 2 as well; the earlier shard keeps the host
    slab.shards[2].host = host_key(2);

    let candidates = contracts(&[1, 2, 3, 4, 5]);
    let migrated = worker.migrate_slab(&mut slab, &candidates).await.unwrap();
    assert_eq!(migrated, vec![2]);

    let new_host = slab.shards[2].host;
    assert!(new_host == host_key(3) || new_host == host_key(5));
    assert_eq!(slab.shards[2].root, original_root);
    assert_eq!(slab.shards[1].host, host_key(2));

    let good: HashSet<_> = (1..=5).map(host_key).collect();
    assert!(slab.is_healthy(&good));
    assert_eq!(read_back(&worker, &slab, &[1, 2, 3, 4, 5]).await, sample(DATA_LEN));
}

#[tokio::test]
async fn test_migrate_several_shards() {
    let cluster = Cluster::new(6);
    let worker = cluster.worker(test_config());
    let mut slab = upload(&worker, &[1, 2, 3, 4]).await;

    // two shards lost, two fresh hosts available
    let migrated = worker
        .migrate_slab(&mut slab, &contracts(&[1, 2, 5, 6]))
        .await
        .unwrap();
    assert_eq!(migrated, vec![2, 3]);

    let hosts: HashSet<_> = slab.hosts().collect();
    let expected: HashSet<_> = [1, 2, 5, 6].into_iter().map(host_key).collect();
    assert_eq!(hosts, expected);
}

#[tokio::test]
async fn test_migrate_not_enough_shards() {
    let cluster = Cluster::new(6);
    let worker = cluster.worker(test_config());
    let mut slab = upload(&worker, &[1, 2, 3, 4]).await;
    let before = slab.clone();

    let err = worker
        .migrate_slab(&mut slab, &contracts(&[1, 5, 6]))
        .await
        .unwrap_err();
    assert!(matches!(err, SlabError::NotEnoughShards { have: 1, need: 2 }));
    assert_eq!(slab, before);
}

#[tokio::test]
async fn test_migrate_not_enough_hosts() {
    let cluster = Cluster::new(4);
    let worker = cluster.worker(test_config());
    let mut slab = upload(&worker, &[1, 2, 3, 4]).await;
    let acquired = cluster.locker.stats().acquired;

    let err = worker
        .migrate_slab(&mut slab, &contracts(&[1, 2]))
        .await
        .unwrap_err();
    assert!(matches!(err, SlabError::NotEnoughHosts { have: 0, need: 2 }));
    assert_eq!(cluster.locker.stats().acquired, acquired);
}

#[tokio::test]
async fn test_migrate_download_failure() {
    let cluster = Cluster::new(5);
    let worker = cluster.worker(test_config());
    let mut slab = upload(&worker, &[1, 2, 3, 4]).await;
    let before = slab.clone();

    for n in 1..=3 {
        cluster.host(n).set_offline(true);
    }
    let err = worker
        .migrate_slab(&mut slab, &contracts(&[1, 2, 3, 5]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SlabError::Migration {
            step: MigrationStep::Download,
            ..
        }
    ));
    let hosts = err.host_errors().unwrap();
    assert_eq!(hosts.len(), 4);
    assert!(err.to_string().starts_with("migration failed to download slab"));
    assert_eq!(slab, before);
}

#[tokio::test]
async fn test_migrate_upload_failure() {
    let cluster = Cluster::new(5);
    let worker = cluster.worker(test_config());
    let mut slab = upload(&worker, &[1, 2, 3, 4]).await;
    let before = slab.clone();

    cluster.host(5).fail_uploads(true);
    let err = worker
        .migrate_slab(&mut slab, &contracts(&[1, 2, 3, 5]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SlabError::Migration {
            step: MigrationStep::Upload,
            ..
        }
    ));
    assert_eq!(err.host_errors().unwrap().hosts(), vec![host_key(5)]);
    assert_eq!(slab, before);
}
