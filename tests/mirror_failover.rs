mod test_utils;

use palisade::{CachedFile, Error, RemoteFile, Repository, UpdateOutcome};
use test_utils::{now, Fixture};
use url::Url;

/// A mirror that has nothing on it is a recoverable failure; the operation completes under the
/// next mirror in the list.
#[test]
fn dead_mirror_fails_over() {
    let fixture = Fixture::new();
    let empty = tempfile::tempdir().unwrap();
    let dead = Url::from_directory_path(empty.path()).unwrap();

    let repository = fixture.repository_at(vec![dead, fixture.mirror_url()]);
    let mut client = palisade::Client::bootstrap(
        repository,
        &fixture.server.path().join("root.json"),
        palisade::ExpirationEnforcement::Safe,
        palisade::Limits::default(),
        now(),
    )
    .unwrap();

    assert_eq!(
        client.check_for_updates(now()).unwrap(),
        UpdateOutcome::Updated
    );
    assert_eq!(
        fixture.cache_file("timestamp.json").unwrap(),
        fixture.server_file("timestamp.json")
    );
}

/// When every mirror fails, the last mirror's error surfaces.
#[test]
fn exhausted_mirrors_surface_the_last_error() {
    let fixture = Fixture::new();
    let empty_a = tempfile::tempdir().unwrap();
    let empty_b = tempfile::tempdir().unwrap();
    let repository = fixture.repository_at(vec![
        Url::from_directory_path(empty_a.path()).unwrap(),
        Url::from_directory_path(empty_b.path()).unwrap(),
    ]);
    let mut client = palisade::Client::bootstrap(
        repository,
        &fixture.server.path().join("root.json"),
        palisade::ExpirationEnforcement::Safe,
        palisade::Limits::default(),
        now(),
    )
    .unwrap();

    match client.check_for_updates(now()) {
        Err(Error::Transport { .. }) => {}
        other => panic!("expected Transport, got {other:?}"),
    }
}

/// `with_remote` outside a `with_mirror` scope is a programmer error, not a download.
#[test]
fn with_remote_requires_a_selected_mirror() {
    let fixture = Fixture::new();
    let repository = fixture.repository();
    let result = repository.with_remote(&RemoteFile::Timestamp, &mut |_, _| Ok(()));
    match result {
        Err(Error::NoMirrorSelected) => {}
        other => panic!("expected NoMirrorSelected, got {other:?}"),
    }
    // and the slot is cleared again when a scope ends
    repository
        .with_mirror(&mut || {
            assert!(repository.get_cached(CachedFile::Timestamp).is_none());
            Ok(())
        })
        .unwrap();
    match repository.with_remote(&RemoteFile::Timestamp, &mut |_, _| Ok(())) {
        Err(Error::NoMirrorSelected) => {}
        other => panic!("expected NoMirrorSelected, got {other:?}"),
    }
}

#[cfg(feature = "http")]
mod over_http {
    use super::test_utils::{now, Fixture};
    use httptest::{matchers::*, responders::status_code, Expectation, Server};
    use palisade::{
        Cache, Client, ExpirationEnforcement, HttpTransportBuilder, Limits, RemoteRepository,
        UpdateOutcome,
    };
    use url::Url;

    /// The first mirror answers 503 to everything; the client logs the failure and completes
    /// the whole operation under the second mirror.
    #[test]
    fn http_503_triggers_failover() {
        let fixture = Fixture::new();
        let server = Server::run();

        server.expect(
            Expectation::matching(request::path(matches("^/m1/.*")))
                .times(1..)
                .respond_with(status_code(503)),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/m2/timestamp-snapshot.json"))
                .times(..)
                .respond_with(status_code(404)),
        );
        for name in [
            "timestamp.json",
            "snapshot.json",
            "mirrors.json",
            "00-index.tar.gz",
        ] {
            let body = fixture.server_file(name);
            server.expect(
                Expectation::matching(request::method_path("GET", format!("/m2/{name}")))
                    .times(1)
                    .respond_with(status_code(200).body(body)),
            );
        }

        let repository = RemoteRepository::new(
            Box::new(HttpTransportBuilder::new().tries(1).build()),
            vec![
                Url::parse(&server.url_str("/m1/")).unwrap(),
                Url::parse(&server.url_str("/m2/")).unwrap(),
            ],
            Cache::open(fixture.cache.path()).unwrap(),
            Limits::default(),
        );
        let mut client = Client::bootstrap(
            repository,
            &fixture.server.path().join("root.json"),
            ExpirationEnforcement::Safe,
            Limits::default(),
            now(),
        )
        .unwrap();

        assert_eq!(
            client.check_for_updates(now()).unwrap(),
            UpdateOutcome::Updated
        );
        assert_eq!(
            fixture.cache_file("timestamp.json").unwrap(),
            fixture.server_file("timestamp.json")
        );
    }
}
