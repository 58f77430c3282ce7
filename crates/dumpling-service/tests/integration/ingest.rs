use std::io::Cursor;

use dumpling_service::error::{ClientInputError, IngestError};
use dumpling_service::service::ArtifactRef;
use dumpling_service::types::ArtifactFormat;

use crate::{cancel, read_blob, scratch_files, setup_service, test, upload};

#[tokio::test]
async fn test_reupload_is_idempotent() {
    let ts = setup_service();
    let elf = test::elf_object(Some(&[0xab; 20]), false);
    let (digest, body) = upload(&elf);

    let hash = ts
        .service
        .upload_artifact(&digest, "/usr/lib/libfoo.so", None, body, &cancel())
        .await
        .unwrap();
    assert_eq!(hash.as_str(), digest);

    // a known artifact is not read again, not even a broken body
    let hash = ts
        .service
        .upload_artifact(
            &digest,
            "/usr/lib/libfoo.so",
            None,
            Cursor::new(b"garbage".to_vec()),
            &cancel(),
        )
        .await
        .unwrap();
    assert_eq!(hash.as_str(), digest);
    assert_eq!(ts.blobs.puts(), 1);

    let artifact = ts
        .service
        .find_artifact(&ArtifactRef::Hash(hash))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.format, ArtifactFormat::Elf);
    assert_eq!(artifact.file_name, "libfoo.so");
    assert_eq!(artifact.size, elf.len() as u64);
    assert!(artifact.url.is_some());
}

#[tokio::test]
async fn test_hash_mismatch() {
    let ts = setup_service();
    let (_, body) = upload(b"actual content");
    let declared = test::sha1_hex(b"declared content");

    let err = ts
        .service
        .upload_artifact(&declared, "notes.txt", None, body, &cancel())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::ClientInput(ClientInputError::HashMismatch { .. })
    ));
    assert!(err.is_client_error());

    let found = ts
        .service
        .find_artifact(&ArtifactRef::Hash(declared.parse().unwrap()))
        .await
        .unwrap();
    assert!(found.is_none());
    assert_eq!(ts.blobs.puts(), 0);
    assert_eq!(scratch_files(&ts.scratch_dir), 0);
}

#[tokio::test]
async fn test_invalid_gzip() {
    let ts = setup_service();
    let digest = test::sha1_hex(b"plain");

    let err = ts
        .service
        .upload_artifact(
            &digest,
            "plain",
            None,
            Cursor::new(b"plain".to_vec()),
            &cancel(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::ClientInput(ClientInputError::InvalidPayload(_))
    ));
    assert_eq!(scratch_files(&ts.scratch_dir), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads() {
    let ts = setup_service();
    let elf = test::elf_object(Some(&[0xcd; 20]), true);
    let digest = test::sha1_hex(&elf);

    let cancel = cancel();
    let uploads = (0..8).map(|_| {
        let body = Cursor::new(test::gzip(&elf));
        ts.service
            .upload_artifact(&digest, "/usr/bin/app", None, body, &cancel)
    });
    let results = futures::future::join_all(uploads).await;

    for result in results {
        assert_eq!(result.unwrap().as_str(), digest);
    }
    assert_eq!(ts.blobs.puts(), 1);
}

#[tokio::test]
async fn test_find_by_index() {
    let ts = setup_service();
    let elf = test::elf_object(Some(&[0xab; 20]), false);
    let (digest, body) = upload(&elf);

    ts.service
        .upload_artifact(&digest, "C:\\Build\\LibFoo.SO", None, body, &cancel())
        .await
        .unwrap();

    let index = format!("libfoo.so/elf-buildid-{}/libfoo.so.gz", "ab".repeat(20));
    let artifact = ts
        .service
        .find_artifact(&ArtifactRef::Index(index.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.hash.as_str(), digest);
    assert_eq!(artifact.uuid.as_deref(), Some("ab".repeat(20).as_str()));

    let download = ts
        .service
        .download_artifact(&ArtifactRef::Index(index.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(download.file_name, "libfoo.so");

    let reader = ts
        .service
        .open_artifact(&ArtifactRef::Index(index))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_blob(reader).await, elf);

    let missing = ts
        .service
        .find_artifact(&ArtifactRef::Index(
            "libfoo.so/elf-buildid-00/libfoo.so.gz".into(),
        ))
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_unknown_format_falls_back_to_digest() {
    let ts = setup_service();
    let (digest, body) = upload(b"just some notes");

    ts.service
        .upload_artifact(&digest, "/tmp/notes.txt", None, body, &cancel())
        .await
        .unwrap();

    let index = format!("notes.txt/sha1-{digest}/notes.txt.gz");
    let artifact = ts
        .service
        .find_artifact(&ArtifactRef::Index(index))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.format, ArtifactFormat::Unknown);
    assert_eq!(artifact.uuid, None);
}

#[tokio::test]
async fn test_same_content_other_name() {
    let ts = setup_service();
    let (digest, body) = upload(b"shared content");
    ts.service
        .upload_artifact(&digest, "a.txt", None, body, &cancel())
        .await
        .unwrap();

    let (_, body) = upload(b"shared content");
    ts.service
        .upload_artifact(&digest, "b.txt", None, body, &cancel())
        .await
        .unwrap();

    // the first name wins, the content is stored once
    let artifact = ts
        .service
        .find_artifact(&ArtifactRef::Hash(digest.parse().unwrap()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.file_name, "a.txt");
    assert_eq!(ts.blobs.puts(), 1);
}

#[tokio::test]
async fn test_cancelled_upload() {
    let ts = setup_service();
    let (digest, body) = upload(b"never stored");
    let cancel = cancel();
    cancel.cancel();

    let err = ts
        .service
        .upload_artifact(&digest, "file", None, body, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Cancelled));
    assert_eq!(scratch_files(&ts.scratch_dir), 0);

    let found = ts
        .service
        .find_artifact(&ArtifactRef::Hash(digest.parse().unwrap()))
        .await
        .unwrap();
    assert!(found.is_none());
}
