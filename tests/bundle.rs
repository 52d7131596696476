mod test_utils;

use palisade::UpdateOutcome;
use test_utils::{now, Fixture};

/// When the server packs timestamp and snapshot into the optional bundle, the client can run a
/// whole check cycle without ever requesting the two documents individually. Removing them
/// from the server proves the bundle was the source.
#[test]
fn bundle_replaces_direct_metadata_fetches() {
    let fixture = Fixture::new();
    fixture.publish_bundle();

    let timestamp_bytes = fixture.server_file("timestamp.json");
    let snapshot_bytes = fixture.server_file("snapshot.json");
    std::fs::remove_file(fixture.server.path().join("timestamp.json")).unwrap();
    std::fs::remove_file(fixture.server.path().join("snapshot.json")).unwrap();

    let mut client = fixture.bootstrap_client();
    assert_eq!(
        client.check_for_updates(now()).unwrap(),
        UpdateOutcome::Updated
    );
    assert_eq!(fixture.cache_file("timestamp.json").unwrap(), timestamp_bytes);
    assert_eq!(fixture.cache_file("snapshot.json").unwrap(), snapshot_bytes);
}

/// A malformed bundle quietly degrades to direct fetches.
#[test]
fn broken_bundle_falls_back_to_direct_fetches() {
    let fixture = Fixture::new();
    std::fs::write(
        fixture.server.path().join("timestamp-snapshot.json"),
        b"this is not a ustar archive",
    )
    .unwrap();

    let mut client = fixture.bootstrap_client();
    assert_eq!(
        client.check_for_updates(now()).unwrap(),
        UpdateOutcome::Updated
    );
    assert_eq!(
        fixture.cache_file("timestamp.json").unwrap(),
        fixture.server_file("timestamp.json")
    );
}
