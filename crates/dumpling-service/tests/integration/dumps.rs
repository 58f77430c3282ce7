use std::collections::BTreeSet;
use std::io::Read;

use dumpling_service::error::{ClientInputError, IngestError};
use dumpling_service::service::{DumpManifest, ManifestEntry};
use dumpling_service::types::{ArtifactFormat, DumpOs};
use dumpling_test::CoreImage;
use tokio::io::AsyncWriteExt;

use crate::{cancel, setup_service, test, upload};

const APP_ID: [u8; 20] = [0x11; 20];
const LIBBAR_ID: [u8; 20] = [0x22; 20];
const CORECLR_ID: [u8; 20] = [0x33; 20];

const LIBBAR_BASE: u64 = 0x7f00_0000_0000;

fn crashed_app() -> Vec<u8> {
    test::elf_core(&[
        CoreImage::executable("/usr/bin/app", test::EXECUTABLE_BASE, Some(&APP_ID)),
        CoreImage::library("/usr/lib/libbar.so", LIBBAR_BASE, Some(&LIBBAR_ID)),
    ])
}

fn libbar() -> Vec<u8> {
    test::elf_object(Some(&LIBBAR_ID), false)
}

fn link<'a>(manifest: &'a DumpManifest, local_path: &str) -> &'a ManifestEntry {
    manifest
        .artifacts
        .iter()
        .find(|entry| entry.link.local_path == local_path)
        .unwrap()
}

#[tokio::test]
async fn test_dump_references_modules() {
    let ts = setup_service();
    let (digest, body) = upload(&crashed_app());

    let response = ts
        .service
        .upload_dump(&digest, "/var/crash/core", "ci", "app crash", body, &cancel())
        .await
        .unwrap();
    assert_eq!(response.dump_id, digest);

    let ref_paths: BTreeSet<_> = response.ref_paths.iter().map(String::as_str).collect();
    assert_eq!(ref_paths, BTreeSet::from(["/usr/bin/app", "/usr/lib/libbar.so"]));

    let manifest = ts.service.get_manifest(&digest).await.unwrap().unwrap();
    assert_eq!(manifest.dump.os, DumpOs::Linux);
    assert_eq!(manifest.dump.user, "ci");
    assert_eq!(manifest.artifacts.len(), 3);

    let core = link(&manifest, "/var/crash/core");
    assert_eq!(core.relative_path, "var/crash/core");
    assert!(core.link.debug_critical);
    let artifact = core.artifact.as_ref().unwrap();
    assert_eq!(artifact.format, ArtifactFormat::ElfCore);

    let app = link(&manifest, "/usr/bin/app");
    assert!(app.link.executable_image);
    assert_eq!(
        app.link.index.as_deref(),
        Some(format!("app/elf-buildid-{}/app.gz", "11".repeat(20)).as_str())
    );
    assert!(app.artifact.is_none());
}

#[tokio::test]
async fn test_module_uploaded_after_dump() {
    let ts = setup_service();
    let (digest, body) = upload(&crashed_app());
    ts.service
        .upload_dump(&digest, "core", "ci", "app crash", body, &cancel())
        .await
        .unwrap();

    // uploaded without dump, linked by its index
    let (libbar_digest, body) = upload(&libbar());
    ts.service
        .upload_artifact(&libbar_digest, "libbar.so", None, body, &cancel())
        .await
        .unwrap();

    let manifest = ts.service.get_manifest(&digest).await.unwrap().unwrap();
    assert_eq!(manifest.artifacts.len(), 3);
    let entry = link(&manifest, "/usr/lib/libbar.so");
    assert_eq!(
        entry.link.hash.as_ref().map(|hash| hash.as_str()),
        Some(libbar_digest.as_str())
    );
    assert_eq!(entry.artifact.as_ref().unwrap().format, ArtifactFormat::Elf);

    // uploading it again for the dump does not add a second file
    let (_, body) = upload(&libbar());
    ts.service
        .upload_artifact(
            &libbar_digest,
            "/usr/lib/libbar.so",
            Some(&digest),
            body,
            &cancel(),
        )
        .await
        .unwrap();
    let manifest = ts.service.get_manifest(&digest).await.unwrap().unwrap();
    assert_eq!(manifest.artifacts.len(), 3);
    assert_eq!(ts.blobs.puts(), 2);
}

#[tokio::test]
async fn test_module_uploaded_before_dump() {
    let ts = setup_service();
    let (libbar_digest, body) = upload(&libbar());
    ts.service
        .upload_artifact(&libbar_digest, "/build/libbar.so", None, body, &cancel())
        .await
        .unwrap();

    let (digest, body) = upload(&crashed_app());
    let response = ts
        .service
        .upload_dump(&digest, "core", "ci", "app crash", body, &cancel())
        .await
        .unwrap();
    assert_eq!(response.ref_paths, ["/usr/bin/app"]);
}

#[tokio::test]
async fn test_runtime_companions() {
    let ts = setup_service();
    let runtime_dir = "/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.1";
    let core = test::elf_core(&[
        CoreImage::executable("/usr/bin/dotnet", test::EXECUTABLE_BASE, Some(&APP_ID)),
        CoreImage::library(
            &format!("{runtime_dir}/libcoreclr.so"),
            LIBBAR_BASE,
            Some(&CORECLR_ID),
        ),
    ]);
    let (digest, body) = upload(&core);

    let response = ts
        .service
        .upload_dump(&digest, "core", "ci", "dotnet crash", body, &cancel())
        .await
        .unwrap();
    let ref_paths: BTreeSet<_> = response.ref_paths.iter().cloned().collect();
    assert!(ref_paths.contains(&format!("{runtime_dir}/libmscordaccore.so")));
    assert!(ref_paths.contains(&format!("{runtime_dir}/libsos.so")));
    assert_eq!(ref_paths.len(), 4);

    // the debugger helper carries the build id of the runtime
    let sos = test::elf_object(Some(&CORECLR_ID), false);
    let (sos_digest, body) = upload(&sos);
    ts.service
        .upload_artifact(&sos_digest, "/symbols/libsos.so", None, body, &cancel())
        .await
        .unwrap();

    let manifest = ts.service.get_manifest(&digest).await.unwrap().unwrap();
    let entry = link(&manifest, &format!("{runtime_dir}/libsos.so"));
    assert_eq!(
        entry.link.index.as_deref(),
        Some(format!("libsos.so/elf-buildid-{}/libsos.so.gz", "33".repeat(20)).as_str())
    );
    assert_eq!(
        entry.link.hash.as_ref().map(|hash| hash.as_str()),
        Some(sos_digest.as_str())
    );
}

#[tokio::test]
async fn test_reupload_dump() {
    let ts = setup_service();
    let (digest, body) = upload(&crashed_app());
    ts.service
        .upload_dump(&digest, "core", "ci", "app crash", body, &cancel())
        .await
        .unwrap();

    let (_, body) = upload(&crashed_app());
    let response = ts
        .service
        .upload_dump(&digest, "core", "ci", "app crash", body, &cancel())
        .await
        .unwrap();
    assert_eq!(response.dump_id, digest);
    assert!(response.ref_paths.is_empty());
    assert_eq!(ts.blobs.puts(), 1);
}

#[tokio::test]
async fn test_failed_dump_upload_can_be_retried() {
    let ts = setup_service();
    let core = crashed_app();
    let digest = test::sha1_hex(&core);

    let (_, wrong_body) = upload(b"not the core");
    let err = ts
        .service
        .upload_dump(&digest, "core", "ci", "app crash", wrong_body, &cancel())
        .await
        .unwrap_err();
    assert!(err.is_client_error());
    let manifest = ts.service.get_manifest(&digest).await.unwrap().unwrap();
    assert!(manifest.artifacts.is_empty());

    let (_, body) = upload(&core);
    let response = ts
        .service
        .upload_dump(&digest, "core", "ci", "app crash", body, &cancel())
        .await
        .unwrap();
    assert_eq!(response.ref_paths.len(), 2);
}

#[tokio::test]
async fn test_concurrent_dump_upload_survives_failed_one() {
    let ts = setup_service();
    let core = crashed_app();
    let digest = test::sha1_hex(&core);

    // the first upload stalls on its body, which turns out to be wrong
    let (stalled, mut writer) = tokio::io::duplex(64 * 1024);
    let token = cancel();
    let failing = ts
        .service
        .upload_dump(&digest, "core", "ci", "app crash", stalled, &token);
    let succeeding = async {
        let (_, body) = upload(&core);
        let response = ts
            .service
            .upload_dump(&digest, "core", "ci", "app crash", body, &cancel())
            .await;
        writer.write_all(&test::gzip(b"not the core")).await.unwrap();
        drop(writer);
        response
    };
    let (failed, response) = tokio::join!(failing, succeeding);

    assert!(failed.unwrap_err().is_client_error());
    let response = response.unwrap();
    assert_eq!(response.dump_id, digest);
    assert_eq!(response.ref_paths.len(), 2);

    let manifest = ts.service.get_manifest(&digest).await.unwrap().unwrap();
    assert_eq!(manifest.dump.os, DumpOs::Linux);
    let dump_file = link(&manifest, "core");
    assert_eq!(
        dump_file.artifact.as_ref().map(|artifact| artifact.hash.as_str()),
        Some(digest.as_str())
    );
}

#[tokio::test]
async fn test_minidump() {
    let ts = setup_service();
    let modules = [
        test::MinidumpModule {
            code_file: r"C:\Program Files\App\App.exe",
            time_date_stamp: 0x5ab3_8077,
            size_of_image: 0x9000,
            pdb_file: Some("App.pdb"),
        },
        test::MinidumpModule {
            code_file: r"C:\Windows\System32\ntdll.dll",
            time_date_stamp: 0x1234_5678,
            size_of_image: 0x1f_0000,
            pdb_file: None,
        },
    ];
    let (digest, body) = upload(&test::minidump(&modules));

    let response = ts
        .service
        .upload_dump(&digest, r"C:\dumps\app.dmp", "ci", "windows crash", body, &cancel())
        .await
        .unwrap();
    let ref_paths: BTreeSet<_> = response.ref_paths.iter().map(String::as_str).collect();
    assert_eq!(
        ref_paths,
        BTreeSet::from([
            "App.pdb",
            r"C:\Program Files\App\App.exe",
            r"C:\Windows\System32\ntdll.dll",
        ])
    );

    let manifest = ts.service.get_manifest(&digest).await.unwrap().unwrap();
    assert_eq!(manifest.dump.os, DumpOs::Windows);
    assert_eq!(manifest.artifacts.len(), 4);

    let dump_file = link(&manifest, r"C:\dumps\app.dmp");
    assert_eq!(
        dump_file.artifact.as_ref().unwrap().format,
        ArtifactFormat::Minidump
    );

    let pdb = link(&manifest, "App.pdb");
    assert_eq!(
        pdb.link.index.as_deref(),
        Some(format!("app.pdb/{}/app.pdb.gz", test::PDB_DEBUG_ID).as_str())
    );
    assert!(!pdb.link.executable_image);

    let exe = link(&manifest, r"C:\Program Files\App\App.exe");
    assert_eq!(
        exe.link.index.as_deref(),
        Some("app.exe/5ab380779000/app.exe.gz")
    );
    assert!(exe.link.executable_image);

    let ntdll = link(&manifest, r"C:\Windows\System32\ntdll.dll");
    assert_eq!(
        ntdll.link.index,
        Some(format!("ntdll.dll/{}/ntdll.dll.gz", modules[1].code_id()))
    );
}

#[tokio::test]
async fn test_mach_core() {
    let ts = setup_service();
    let (digest, body) = upload(&test::mach_core());

    let response = ts
        .service
        .upload_dump(&digest, "core.1234", "ci", "mac crash", body, &cancel())
        .await
        .unwrap();
    assert!(response.ref_paths.is_empty());

    let manifest = ts.service.get_manifest(&digest).await.unwrap().unwrap();
    assert_eq!(manifest.dump.os, DumpOs::Darwin);
    assert_eq!(manifest.artifacts.len(), 1);
}

#[tokio::test]
async fn test_upload_to_unknown_dump() {
    let ts = setup_service();
    let (digest, body) = upload(&libbar());

    let err = ts
        .service
        .upload_artifact(&digest, "libbar.so", Some("nope"), body, &cancel())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::ClientInput(ClientInputError::UnknownDump(_))
    ));
    assert_eq!(ts.blobs.puts(), 0);
}

#[tokio::test]
async fn test_artifacts_of_created_dump() {
    let ts = setup_service();
    let dump = ts.service.create_dump("ci", "manual").await.unwrap();

    let (digest, body) = upload(b"a log file");
    ts.service
        .upload_artifact(&digest, "logs/app.log", Some(&dump.dump_id), body, &cancel())
        .await
        .unwrap();

    let manifest = ts.service.get_manifest(&dump.dump_id).await.unwrap().unwrap();
    assert_eq!(manifest.artifacts.len(), 1);
    let entry = &manifest.artifacts[0];
    assert!(!entry.link.debug_critical);
    assert_eq!(entry.relative_path, "logs/app.log");
}

#[tokio::test]
async fn test_archive_dump() {
    let ts = setup_service();
    let core = crashed_app();
    let (digest, body) = upload(&core);
    ts.service
        .upload_dump(&digest, "/var/crash/core", "ci", "app crash", body, &cancel())
        .await
        .unwrap();
    let (libbar_digest, body) = upload(&libbar());
    ts.service
        .upload_artifact(&libbar_digest, "libbar.so", None, body, &cancel())
        .await
        .unwrap();

    let archive = ts
        .service
        .archive_dump(&digest, &cancel())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archive.file_name, "app crash.zip");

    let mut zip = zip::ZipArchive::new(archive.file.reopen().unwrap()).unwrap();
    let mut names: Vec<_> = zip.file_names().map(str::to_owned).collect();
    names.sort();
    assert_eq!(names, ["usr/lib/libbar.so", "var/crash/core"]);

    let mut content = Vec::new();
    zip.by_name("var/crash/core")
        .unwrap()
        .read_to_end(&mut content)
        .unwrap();
    assert_eq!(content, core);

    assert!(ts.service.archive_dump("nope", &cancel()).await.unwrap().is_none());
}
