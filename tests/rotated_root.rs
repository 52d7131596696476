mod test_utils;

use palisade::{Error, UpdateOutcome};
use test_utils::{build_root, now, sign_role, Fixture, Keys, Publish};

/// Every role key rotates at once. The new root is cross-signed by the old and new root keys,
/// so the client follows the rotation mid-cycle and re-verifies everything under the new keys.
#[test]
fn cross_signed_rotation_is_followed() {
    let mut fixture = Fixture::new();
    let mut client = fixture.bootstrap_client();
    client.check_for_updates(now()).unwrap();

    let new_keys = Keys::generate();
    let root_bytes = sign_role(
        build_root(&new_keys, 2),
        &[&fixture.keys.root, &new_keys.root],
    );
    fixture.publish_as(
        Some(&new_keys),
        &Publish {
            root_version: 2,
            timestamp_version: 2,
            snapshot_version: 2,
            mirrors_version: 2,
            root_bytes: Some(root_bytes.clone()),
            ..Publish::default()
        },
    );

    assert_eq!(
        client.check_for_updates(now()).unwrap(),
        UpdateOutcome::Updated
    );
    assert_eq!(client.trust().root().get().version.get(), 2);
    assert_eq!(fixture.cache_file("root.json").unwrap(), root_bytes);
    // the timestamp now verifying is the one signed by the rotated keys
    assert_eq!(
        fixture.cache_file("timestamp.json").unwrap(),
        fixture.server_file("timestamp.json")
    );
}

/// A root that is not signed by the old root role's keys must not take over, however valid its
/// own signatures are.
#[test]
fn rotation_without_old_signatures_is_rejected() {
    let mut fixture = Fixture::new();
    let mut client = fixture.bootstrap_client();
    client.check_for_updates(now()).unwrap();

    let old_root_bytes = fixture.server_file("root.json");

    let new_keys = Keys::generate();
    let root_bytes = sign_role(build_root(&new_keys, 2), &[&new_keys.root]);
    fixture.publish_as(
        Some(&new_keys),
        &Publish {
            root_version: 2,
            timestamp_version: 2,
            snapshot_version: 2,
            mirrors_version: 2,
            root_bytes: Some(root_bytes),
            ..Publish::default()
        },
    );

    match client.check_for_updates(now()) {
        Err(Error::SignatureThresholdNotMet { .. }) => {}
        other => panic!("expected SignatureThresholdNotMet, got {other:?}"),
    }
    assert_eq!(client.trust().root().get().version.get(), 1);
    assert_eq!(fixture.cache_file("root.json").unwrap(), old_root_bytes);
}
