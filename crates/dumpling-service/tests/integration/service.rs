use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use dumpling_service::blobs::{BlobKey, BlobStore};
use dumpling_service::service::ArtifactRef;
use dumpling_service::formats::UploadKind;
use dumpling_service::types::{Dump, FAILURE_HASH, UNTRIAGED};

use crate::{cancel, setup_service, upload};

fn props(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[tokio::test]
async fn test_dump_properties() {
    let ts = setup_service();
    let dump = ts.service.create_dump("ci", "nightly").await.unwrap();

    let updated = ts
        .service
        .update_dump_properties(
            &dump.dump_id,
            &props(&[("branch", "main"), (FAILURE_HASH, "segv-in-foo")]),
        )
        .await
        .unwrap();
    assert_eq!(updated.failure_hash.as_deref(), Some("segv-in-foo"));

    // values are replaced, other properties stay
    ts.service
        .update_dump_properties(&dump.dump_id, &props(&[("branch", "release")]))
        .await
        .unwrap();

    let manifest = ts.service.get_manifest(&dump.dump_id).await.unwrap().unwrap();
    assert_eq!(
        manifest.properties,
        props(&[("branch", "release"), (FAILURE_HASH, "segv-in-foo")])
    );
    assert_eq!(manifest.dump.failure_hash.as_deref(), Some("segv-in-foo"));
}

#[tokio::test]
async fn test_find_dumps() {
    let ts = setup_service();
    let triaged = ts.service.create_dump("ci", "triaged").await.unwrap();
    let untriaged = ts.service.create_dump("ci", "untriaged").await.unwrap();
    ts.service
        .update_dump_properties(
            &triaged.dump_id,
            &props(&[("branch", "main"), (FAILURE_HASH, "oom")]),
        )
        .await
        .unwrap();
    ts.service
        .update_dump_properties(&untriaged.dump_id, &props(&[("branch", "main")]))
        .await
        .unwrap();

    let start = Utc::now() - Duration::hours(1);
    let end = Utc::now() + Duration::hours(1);
    let ids = |dumps: Vec<Dump>| -> Vec<String> {
        dumps.into_iter().map(|dump| dump.dump_id).collect()
    };

    let all = ts
        .service
        .find_dumps(start, end, &props(&[("branch", "main")]))
        .await
        .unwrap();
    let mut all = ids(all);
    all.sort();
    let mut expected = vec![triaged.dump_id.clone(), untriaged.dump_id.clone()];
    expected.sort();
    assert_eq!(all, expected);

    let by_failure = ts
        .service
        .find_dumps(start, end, &props(&[(FAILURE_HASH, "oom")]))
        .await
        .unwrap();
    assert_eq!(ids(by_failure), [triaged.dump_id.clone()]);

    let open = ts
        .service
        .find_dumps(start, end, &props(&[(FAILURE_HASH, UNTRIAGED)]))
        .await
        .unwrap();
    assert_eq!(ids(open), [untriaged.dump_id.clone()]);

    let none = ts
        .service
        .find_dumps(start, end, &props(&[("branch", "release")]))
        .await
        .unwrap();
    assert!(none.is_empty());

    let earlier = ts
        .service
        .find_dumps(start - Duration::days(1), start, &BTreeMap::new())
        .await
        .unwrap();
    assert!(earlier.is_empty());

    let groups = ts.service.dumps_by_failure(None, None).await.unwrap();
    let groups: BTreeMap<_, _> = groups
        .into_iter()
        .map(|(failure, dumps)| (failure, ids(dumps)))
        .collect();
    assert_eq!(
        groups,
        BTreeMap::from([
            ("oom".to_owned(), vec![triaged.dump_id]),
            (UNTRIAGED.to_owned(), vec![untriaged.dump_id]),
        ])
    );
}

#[tokio::test]
async fn test_delete_artifact() {
    let ts = setup_service();
    let dump = ts.service.create_dump("ci", "nightly").await.unwrap();
    let (digest, body) = upload(b"debug log");
    ts.service
        .upload_artifact(&digest, "debug.log", Some(&dump.dump_id), body, &cancel())
        .await
        .unwrap();

    let index = format!("debug.log/sha1-{digest}/debug.log.gz");
    assert!(ts.service.delete_artifact(&digest).await.unwrap());

    let hash = digest.parse().unwrap();
    let by_hash = ts
        .service
        .find_artifact(&ArtifactRef::Hash(hash))
        .await
        .unwrap();
    assert!(by_hash.is_none());
    let by_index = ts
        .service
        .find_artifact(&ArtifactRef::Index(index))
        .await
        .unwrap();
    assert!(by_index.is_none());

    // the file of the dump stays, unresolved
    let manifest = ts.service.get_manifest(&dump.dump_id).await.unwrap().unwrap();
    assert_eq!(manifest.artifacts.len(), 1);
    assert_eq!(manifest.artifacts[0].link.hash, None);
    assert!(manifest.artifacts[0].artifact.is_none());

    let key = BlobKey::compressed(&digest.parse().unwrap(), "debug.log");
    assert!(!ts.blobs.exists(&key).await.unwrap());

    assert!(!ts.service.delete_artifact(&digest).await.unwrap());
    assert!(ts.service.delete_artifact("not a digest").await.is_err());
}

#[tokio::test]
async fn test_deleted_artifact_can_be_uploaded_again() {
    let ts = setup_service();
    let (digest, body) = upload(b"short lived");
    ts.service
        .upload_artifact(&digest, "file", None, body, &cancel())
        .await
        .unwrap();
    ts.service.delete_artifact(&digest).await.unwrap();

    let (_, body) = upload(b"short lived");
    ts.service
        .upload_artifact(&digest, "file", None, body, &cancel())
        .await
        .unwrap();

    let download = ts
        .service
        .download_artifact(&ArtifactRef::Hash(digest.parse().unwrap()))
        .await
        .unwrap();
    assert!(download.is_some());
    assert_eq!(ts.blobs.puts(), 2);
}

#[tokio::test]
async fn test_inspect() {
    let ts = setup_service();
    let (digest, body) = upload(b"inspected only");

    let inspection = ts
        .service
        .inspect(
            &digest,
            "notes.txt",
            UploadKind::Artifact,
            body,
            &cancel(),
        )
        .await
        .unwrap();
    assert_eq!(inspection.digest.as_str(), digest);
    assert_eq!(
        inspection.index.as_deref(),
        Some(format!("notes.txt/sha1-{digest}/notes.txt.gz").as_str())
    );
    assert!(inspection.modules.is_empty());

    // nothing is stored
    assert_eq!(ts.blobs.puts(), 0);
    let found = ts
        .service
        .find_artifact(&ArtifactRef::Hash(inspection.digest))
        .await
        .unwrap();
    assert!(found.is_none());
}
