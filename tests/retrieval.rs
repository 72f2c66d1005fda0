mod common;

use common::Harness;
use tape_archiver::{
    errors::ArchiveError,
    models::{
        bundle::{Bundle, NewBundle},
        job::JobKind,
        media_file::MediaFile,
    },
    services::retrieval::Retriever,
};
use std::time::Duration;
use uuid::Uuid;

const NAMES: [&str; 5] = ["IMG_1.jpg", "IMG_2.jpg", "IMG_3.jpg", "IMG_4.jpg", "IMG_10.jpg"];

/// An archived bundle whose files exist only on the remote host.
async fn archived_bundle(h: &Harness) -> (Bundle, Vec<MediaFile>) {
    let mut files = Vec::new();
    for (day, name) in NAMES.iter().enumerate() {
        files.push(h.add_file(&format!("ABC/dep-1/{name}"), 1.0, day as u32 + 1).await);
    }
    let bundle = h
        .catalog
        .insert_bundle(NewBundle {
            archive_id: h.archive.id,
            name: "ABC_Camera_b".into(),
            path: "archive/ABC/Camera/ABC_Camera_b.tar.gz".into(),
        })
        .await
        .unwrap();
    let ids: Vec<Uuid> = files.iter().map(|f| f.id).collect();
    h.catalog.attach_files(bundle.id, &ids).await.unwrap();
    assert!(h.catalog.try_mark_uploading(bundle.id).await.unwrap());
    h.catalog.finish_upload(bundle.id, true).await.unwrap();
    h.catalog.set_bundle_local_storage(bundle.id, false).await.unwrap();

    for file in files.iter_mut() {
        std::fs::remove_file(file.local_path(h.storage.path())).unwrap();
        file.local_storage = false;
    }
    h.catalog.mark_retrieved(&files).await.unwrap();

    h.remote.with(|r| {
        r.files.insert(
            "/tape/archive/ABC/Camera/ABC_Camera_b.tar.gz".into(),
            b"tarball".to_vec(),
        );
        r.tar_listing = ["bagit.txt", "manifest-md5.txt", "metadata.json"]
            .iter()
            .map(|m| format!("-rw-r--r-- svc/svc 64 2024-05-06 10:00 {m}"))
            .chain(
                NAMES
                    .iter()
                    .map(|n| format!("-rw-r--r-- svc/svc 1024 2024-05-06 10:00 data/ABC/dep-1/{n}")),
            )
            .collect();
    });
    (bundle, files)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn one_failed_copy_does_not_fail_the_job() {
    let h = Harness::new().await;
    let (bundle, files) = archived_bundle(&h).await;
    h.remote.with(|r| {
        r.fail_download.insert("IMG_3.jpg".into());
    });

    let retrieved = h.archiver.retrieve(bundle.id, &names(&NAMES)).await.unwrap();
    let mut got: Vec<&str> = retrieved.iter().map(|f| f.name.as_str()).collect();
    got.sort();
    assert_eq!(got, ["IMG_1.jpg", "IMG_10.jpg", "IMG_2.jpg", "IMG_4.jpg"]);

    for file in h.catalog.files_in_bundle(bundle.id).await.unwrap() {
        let on_disk = file.local_path(h.storage.path()).exists();
        if file.name == "IMG_3.jpg" {
            assert!(!file.local_storage && !on_disk);
        } else {
            assert!(file.local_storage && on_disk, "{} not restored", file.name);
        }
    }
    assert_eq!(files.len(), 5);

    h.remote.with(|r| {
        assert_eq!(r.connects, 1);
        assert_eq!(r.closes, 1);
        assert_eq!(r.dirs.len(), 1);
        assert!(r.dirs[0].starts_with("/tape/tmp/"));
        assert_eq!(r.issued("tar -zxvf").len(), 1);
        assert_eq!(r.issued("rm -rf "), [format!("rm -rf {}", r.dirs[0])]);
        assert!(r.issued("dmget").is_empty());
    });
}

#[tokio::test]
async fn only_exact_names_are_extracted() {
    let h = Harness::new().await;
    let (bundle, _) = archived_bundle(&h).await;

    let retrieved = h
        .archiver
        .retrieve(bundle.id, &names(&["IMG_1.jpg", "IMG_99.jpg"]))
        .await
        .unwrap();
    assert_eq!(retrieved.len(), 1);
    assert_eq!(retrieved[0].name, "IMG_1.jpg");

    h.remote.with(|r| {
        let extract = &r.issued("tar -zxvf")[0];
        assert!(extract.ends_with(" data/ABC/dep-1/IMG_1.jpg"));
        assert!(!extract.contains("IMG_10"));
    });
}

#[tokio::test]
async fn already_staging_raises_without_a_stage_request() {
    let h = Harness::new().await;
    let (bundle, _) = archived_bundle(&h).await;
    h.remote.with(|r| r.tokens.push_back("(UNM)"));

    let tape = h.archiver.config.tape_commands();
    let retriever = Retriever {
        catalog: &h.catalog,
        connector: h.archiver.connector.as_ref(),
        storage_dir: h.storage.path(),
        tape: &tape,
        chunk_size: 500,
    };
    let err = retriever
        .retrieve(Uuid::new_v4(), bundle.id, &names(&["IMG_1.jpg"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::AlreadyStaging(_)));
    assert!(err.retry_signal().is_some());

    h.remote.with(|r| {
        assert!(r.issued("dmget").is_empty());
        assert!(r.dirs.is_empty());
        assert_eq!(r.closes, 1);
    });
}

#[tokio::test]
async fn job_backs_off_while_staging_then_completes() {
    let h = Harness::new().await;
    let (bundle, _) = archived_bundle(&h).await;
    h.remote.with(|r| {
        r.tokens.extend(["(UNM)", "(UNM)", "(UNM)", "(DUL)"]);
    });

    let retrieved = h
        .archiver
        .retrieve(bundle.id, &names(&["IMG_2.jpg"]))
        .await
        .unwrap();
    assert_eq!(retrieved.len(), 1);

    h.remote.with(|r| {
        assert_eq!(r.connects, 4);
        assert_eq!(r.closes, 4);
        assert!(r.issued("dmget").is_empty());
    });
    assert!(h.catalog.active_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn offline_bundle_is_staged_once_per_attempt() {
    let h = Harness::new().await;
    let (bundle, _) = archived_bundle(&h).await;
    h.remote.with(|r| r.tokens.extend(["(OFL)", "(REG)"]));

    h.archiver
        .retrieve(bundle.id, &names(&["IMG_4.jpg"]))
        .await
        .unwrap();
    h.remote.with(|r| {
        assert_eq!(
            r.issued("dmget"),
            ["dmget /tape/archive/ABC/Camera/ABC_Camera_b.tar.gz"]
        );
    });
}

#[tokio::test]
async fn retrieval_proceeds_below_the_concurrency_limit() {
    let h = Harness::new().await;
    let (bundle, _) = archived_bundle(&h).await;
    for _ in 0..3 {
        h.catalog
            .insert_job(Uuid::new_v4(), JobKind::Retrieve, None)
            .await
            .unwrap();
    }

    let retrieved = h
        .archiver
        .retrieve(bundle.id, &names(&["IMG_1.jpg"]))
        .await
        .unwrap();
    assert_eq!(retrieved.len(), 1);
}

#[tokio::test]
async fn jobs_left_behind_by_a_dead_process_do_not_block_retrieval() {
    let h = Harness::new().await;
    let (bundle, _) = archived_bundle(&h).await;
    for _ in 0..h.archiver.config.max_concurrent_retrievals {
        h.catalog
            .insert_job(Uuid::new_v4(), JobKind::Retrieve, None)
            .await
            .unwrap();
    }
    // Nobody beats for these rows; let them go stale.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let retrieved = tokio::time::timeout(
        Duration::from_secs(3),
        h.archiver.retrieve(bundle.id, &names(&["IMG_1.jpg"])),
    )
    .await
    .expect("retrieval never admitted")
    .unwrap();
    assert_eq!(retrieved.len(), 1);
    h.remote.with(|r| assert_eq!(r.connects, 1));
}
