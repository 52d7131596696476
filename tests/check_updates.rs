mod test_utils;

use palisade::{Error, PackageId, UpdateOutcome};
use test_utils::{now, Fixture, Publish};

#[test]
fn first_use_populates_the_cache() {
    let fixture = Fixture::new();
    let mut client = fixture.bootstrap_client();

    assert_eq!(
        client.check_for_updates(now()).unwrap(),
        UpdateOutcome::Updated
    );

    for name in [
        "root.json",
        "timestamp.json",
        "snapshot.json",
        "mirrors.json",
        "00-index.tar",
    ] {
        assert_eq!(
            fixture.cache_file(name).unwrap(),
            fixture.server_file(name),
            "cached {name} differs from the published copy"
        );
    }
    assert!(fixture.cache_file("00-index.tar.idx").is_some());

    assert_eq!(
        client.check_for_updates(now()).unwrap(),
        UpdateOutcome::UpToDate
    );
}

#[test]
fn download_package_verifies_and_writes() {
    let fixture = Fixture::new();
    let mut client = fixture.bootstrap_client();
    client.check_for_updates(now()).unwrap();

    let id: PackageId = "acme-widgets-1.2.0".parse().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("acme-widgets-1.2.0.tar.gz");
    client.download_package(&id, &dest, now()).unwrap();
    assert_eq!(
        std::fs::read(&dest).unwrap(),
        fixture.packages[0].1,
        "downloaded archive differs from the published one"
    );

    let cabal = client
        .read_index_file(&id, "acme-widgets.cabal")
        .unwrap()
        .unwrap();
    assert!(cabal.starts_with(b"name: acme-widgets"));
}

#[test]
fn corrupted_package_is_rejected() {
    let fixture = Fixture::new();
    let mut client = fixture.bootstrap_client();
    client.check_for_updates(now()).unwrap();

    // same length, different bytes: the length bound passes, the digest must not
    let original = &fixture.packages[0].1;
    let garbage = vec![0x41u8; original.len()];
    std::fs::write(
        fixture
            .server
            .path()
            .join("package/acme-widgets-1.2.0.tar.gz"),
        garbage,
    )
    .unwrap();

    let id: PackageId = "acme-widgets-1.2.0".parse().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("acme-widgets-1.2.0.tar.gz");
    match client.download_package(&id, &dest, now()) {
        Err(Error::InvalidFileInfo { .. }) => {}
        other => panic!("expected InvalidFileInfo, got {other:?}"),
    }
    assert!(!dest.exists());
}

#[test]
fn reload_from_cached_state() {
    let fixture = Fixture::new();
    let mut first = fixture.bootstrap_client();
    first.check_for_updates(now()).unwrap();
    drop(first);

    let mut second = fixture.load_client();
    assert!(second.trust().timestamp().is_some());
    assert!(second.trust().snapshot().is_some());
    assert_eq!(
        second.check_for_updates(now()).unwrap(),
        UpdateOutcome::UpToDate
    );
}

#[test]
fn new_package_flows_through_an_update() {
    let mut fixture = Fixture::new();
    let mut client = fixture.bootstrap_client();
    client.check_for_updates(now()).unwrap();

    fixture.add_package("acme-gears-0.9.1", b"acme-gears 0.9.1 release archive");
    fixture.publish(&Publish {
        timestamp_version: 2,
        snapshot_version: 2,
        ..Publish::default()
    });

    assert_eq!(
        client.check_for_updates(now()).unwrap(),
        UpdateOutcome::Updated
    );

    let id: PackageId = "acme-gears-0.9.1".parse().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("acme-gears-0.9.1.tar.gz");
    client.download_package(&id, &dest, now()).unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), fixture.packages[1].1);
}

#[test]
fn unknown_target_is_not_found() {
    let fixture = Fixture::new();
    let mut client = fixture.bootstrap_client();
    client.check_for_updates(now()).unwrap();

    let id: PackageId = "acme-missing-9.9.9".parse().unwrap();
    let out = tempfile::tempdir().unwrap();
    match client.download_package(&id, &out.path().join("x.tar.gz"), now()) {
        Err(Error::TargetNotFound { path }) => {
            assert_eq!(path, "package/acme-missing-9.9.9.tar.gz");
        }
        other => panic!("expected TargetNotFound, got {other:?}"),
    }
}
