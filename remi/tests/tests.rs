use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use common::error::Error;
use common::testutils;
use common::{Fileset, IoProvider, PROVIDER_ID_ANY};
use remi::{Client, MigrationClass, Service, SourceDisposition, TransferMode};

async fn start_service(classes: &[&str]) -> (Service, String) {
    let service = Service::bind("127.0.0.1:0").await.unwrap();
    let provider = service.register_provider(1).unwrap();
    for class in classes {
        provider
            .register_migration_class(class, PROVIDER_ID_ANY, MigrationClass::new())
            .unwrap();
    }
    let addr = addr_of(&service);
    (service, addr)
}

fn addr_of(service: &Service) -> String {
    service.local_addr().to_string()
}

fn fileset_with_files(class: &str, root: &std::path::Path, files: &[&str]) -> Fileset {
    let mut fileset = Fileset::new(class, root.to_str().unwrap()).unwrap();
    for file in files {
        fileset.register_file(file).unwrap();
    }
    fileset
}

async fn migrate(
    addr: &str,
    fileset: &Fileset,
    remote_root: &std::path::Path,
    disposition: SourceDisposition,
    mode: TransferMode,
) -> common::Result<()> {
    let client = Client::new();
    let handle = client.provider_handle(addr, 1).await?;
    handle
        .migrate(fileset, remote_root.to_str().unwrap(), disposition, mode)
        .await
}

#[tokio::test]
async fn mmap_migration_keeps_sources() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a.bin", "hello"), ("d/b.bin", "world!")]);
    let (_service, addr) = start_service(&["c"]).await;
    let fileset = fileset_with_files("c", src.path(), &["a.bin", "d/b.bin"]);
    migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Mmap,
    )
    .await?;
    assert_eq!(std::fs::read_to_string(dst.path().join("a.bin"))?, "hello");
    assert_eq!(
        std::fs::read_to_string(dst.path().join("d/b.bin"))?,
        "world!"
    );
    // sources untouched
    assert_eq!(std::fs::read_to_string(src.path().join("a.bin"))?, "hello");
    assert_eq!(
        std::fs::read_to_string(src.path().join("d/b.bin"))?,
        "world!"
    );
    testutils::check_trees_identical(src.path(), dst.path()).await;
    Ok(())
}

#[tokio::test]
async fn remove_source_deletes_migrated_files() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a.bin", "hello"), ("d/b.bin", "world!")]);
    let (_service, addr) = start_service(&["c"]).await;
    let fileset = fileset_with_files("c", src.path(), &["a.bin", "d/b.bin"]);
    migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::RemoveSource,
        TransferMode::Mmap,
    )
    .await?;
    assert!(!src.path().join("a.bin").exists());
    assert!(!src.path().join("d/b.bin").exists());
    assert_eq!(std::fs::read_to_string(dst.path().join("a.bin"))?, "hello");
    Ok(())
}

#[tokio::test]
async fn existing_destination_file_refuses_migration() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a.bin", "hello"), ("d/b.bin", "world!")]);
    testutils::populate(dst.path(), &[("a.bin", "old contents")]);
    let (_service, addr) = start_service(&["c"]).await;
    let fileset = fileset_with_files("c", src.path(), &["a.bin", "d/b.bin"]);
    let result = migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::RemoveSource,
        TransferMode::Mmap,
    )
    .await;
    assert!(matches!(result, Err(Error::FileExists)));
    // the pre-existing file is untouched and nothing else was created
    assert_eq!(
        std::fs::read_to_string(dst.path().join("a.bin"))?,
        "old contents"
    );
    assert!(!dst.path().join("d").exists());
    // refusal keeps the sources even with RemoveSource
    assert_eq!(std::fs::read_to_string(src.path().join("a.bin"))?, "hello");
    Ok(())
}

#[tokio::test]
async fn before_callback_status_aborts_migration() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a.bin", "hello")]);
    let service = Service::bind("127.0.0.1:0").await.unwrap();
    let provider = service.register_provider(1).unwrap();
    provider
        .register_migration_class(
            "c",
            PROVIDER_ID_ANY,
            MigrationClass::new().on_before(|_| 42),
        )
        .unwrap();
    let fileset = fileset_with_files("c", src.path(), &["a.bin"]);
    let result = migrate(
        &addr_of(&service),
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Mmap,
    )
    .await;
    assert!(matches!(result, Err(Error::User(42))));
    assert!(!dst.path().join("a.bin").exists());
    Ok(())
}

#[tokio::test]
async fn after_callback_status_keeps_sources() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a.bin", "hello")]);
    let service = Service::bind("127.0.0.1:0").await.unwrap();
    let provider = service.register_provider(1).unwrap();
    provider
        .register_migration_class("c", PROVIDER_ID_ANY, MigrationClass::new().on_after(|_| 7))
        .unwrap();
    let fileset = fileset_with_files("c", src.path(), &["a.bin"]);
    let result = migrate(
        &addr_of(&service),
        &fileset,
        dst.path(),
        SourceDisposition::RemoveSource,
        TransferMode::Mmap,
    )
    .await;
    assert!(matches!(result, Err(Error::User(7))));
    // data is never destroyed on a user-visible failure
    assert_eq!(std::fs::read_to_string(src.path().join("a.bin"))?, "hello");
    Ok(())
}

#[tokio::test]
async fn unknown_class_is_rejected() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a.bin", "hello")]);
    let (_service, addr) = start_service(&["c"]).await;
    let fileset = fileset_with_files("zz", src.path(), &["a.bin"]);
    let result = migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Mmap,
    )
    .await;
    assert!(matches!(result, Err(Error::UnknownClass)));
    assert!(!dst.path().join("a.bin").exists());
    Ok(())
}

#[tokio::test]
async fn modes_carry_over_to_the_destination() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("x.sh", "#!/bin/sh\n"), ("quiet", "shh")]);
    testutils::set_file_mode(&src.path().join("x.sh"), 0o750);
    testutils::set_file_mode(&src.path().join("quiet"), 0o604);
    let (_service, addr) = start_service(&["c"]).await;
    let fileset = fileset_with_files("c", src.path(), &["x.sh", "quiet"]);
    migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Chunked,
    )
    .await?;
    assert_eq!(testutils::file_mode(&dst.path().join("x.sh")), 0o750);
    assert_eq!(testutils::file_mode(&dst.path().join("quiet")), 0o604);
    Ok(())
}

#[tokio::test]
async fn registered_directories_expand_recursively() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(
        src.path(),
        &[
            ("top.bin", "t"),
            ("tree/one", "1"),
            ("tree/sub/two", "22"),
            ("tree/.hidden", "no"),
        ],
    );
    let (_service, addr) = start_service(&["c"]).await;
    let mut fileset = fileset_with_files("c", src.path(), &["top.bin"]);
    fileset.register_directory("tree")?;
    migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Mmap,
    )
    .await?;
    assert_eq!(std::fs::read_to_string(dst.path().join("top.bin"))?, "t");
    assert_eq!(std::fs::read_to_string(dst.path().join("tree/one"))?, "1");
    assert_eq!(
        std::fs::read_to_string(dst.path().join("tree/sub/two"))?,
        "22"
    );
    // dot entries are not part of the expansion
    assert!(!dst.path().join("tree/.hidden").exists());
    Ok(())
}

#[tokio::test]
async fn remove_source_removes_registered_directories() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("tree/one", "1"), ("tree/sub/two", "22")]);
    let (_service, addr) = start_service(&["c"]).await;
    let mut fileset = Fileset::new("c", src.path().to_str().unwrap())?;
    fileset.register_directory("tree")?;
    migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::RemoveSource,
        TransferMode::Chunked,
    )
    .await?;
    assert!(!src.path().join("tree").exists());
    assert_eq!(std::fs::read_to_string(dst.path().join("tree/one"))?, "1");
    Ok(())
}

#[tokio::test]
async fn empty_files_are_recreated() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("empty", ""), ("full", "data")]);
    let (_service, addr) = start_service(&["c"]).await;
    let fileset = fileset_with_files("c", src.path(), &["empty", "full"]);
    migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Mmap,
    )
    .await?;
    assert_eq!(std::fs::metadata(dst.path().join("empty"))?.len(), 0);
    assert_eq!(std::fs::read_to_string(dst.path().join("full"))?, "data");
    Ok(())
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn chunk_size_never_changes_the_outcome() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    std::fs::write(src.path().join("blob"), patterned(1000))?;
    let (_service, addr) = start_service(&["c"]).await;
    let reference = tempfile::tempdir()?;
    let fileset = fileset_with_files("c", src.path(), &["blob"]);
    migrate(
        &addr,
        &fileset,
        reference.path(),
        SourceDisposition::KeepSource,
        TransferMode::Mmap,
    )
    .await?;
    for xfer_size in [1u64, 7, 333, 1000, 5000] {
        let dst = tempfile::tempdir()?;
        let mut fileset = fileset_with_files("c", src.path(), &["blob"]);
        fileset.set_xfer_size(xfer_size)?;
        migrate(
            &addr,
            &fileset,
            dst.path(),
            SourceDisposition::KeepSource,
            TransferMode::Chunked,
        )
        .await?;
        assert_eq!(
            std::fs::read(dst.path().join("blob"))?,
            std::fs::read(reference.path().join("blob"))?,
            "xfer_size {xfer_size} altered the data"
        );
    }
    Ok(())
}

#[tokio::test]
async fn pipelined_chunked_transfer_matches_the_source() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let payload = patterned(3 << 20);
    std::fs::write(src.path().join("big.bin"), &payload)?;
    let service = Service::bind("127.0.0.1:0").await.unwrap();
    let provider = service.register_provider(1).unwrap();
    provider
        .register_migration_class("c", PROVIDER_ID_ANY, MigrationClass::new())
        .unwrap();
    provider.set_io_provider(Some(IoProvider::new(8)?));
    let client = Client::new();
    client.set_io_provider(Some(IoProvider::new(8)?));
    let handle = client.provider_handle(&addr_of(&service), 1).await?;
    let mut fileset = fileset_with_files("c", src.path(), &["big.bin"]);
    fileset.set_xfer_size(64 << 10)?;
    handle
        .migrate(
            &fileset,
            dst.path().to_str().unwrap(),
            SourceDisposition::KeepSource,
            TransferMode::Chunked,
        )
        .await?;
    assert_eq!(std::fs::read(dst.path().join("big.bin"))?, payload);
    Ok(())
}

#[tokio::test]
async fn concurrent_migrations_do_not_interfere() -> anyhow::Result<()> {
    let src_a = tempfile::tempdir()?;
    let src_b = tempfile::tempdir()?;
    let dst_a = tempfile::tempdir()?;
    let dst_b = tempfile::tempdir()?;
    testutils::populate(src_a.path(), &[("one/a", "aaa"), ("b", "bb")]);
    testutils::populate(src_b.path(), &[("two/c", "cc"), ("d", "dddd")]);
    let (service, addr) = start_service(&["left", "right"]).await;
    let client = Client::new();
    let handle_a = client.provider_handle(&addr, 1).await?;
    let handle_b = client.provider_handle(&addr, 1).await?;
    assert_eq!(client.provider_handle_count(), 2);
    let mut fileset_a = Fileset::new("left", src_a.path().to_str().unwrap())?;
    fileset_a.register_directory("one")?;
    fileset_a.register_file("b")?;
    let mut fileset_b = Fileset::new("right", src_b.path().to_str().unwrap())?;
    fileset_b.register_directory("two")?;
    fileset_b.register_file("d")?;
    fileset_b.set_xfer_size(2)?;
    let (left, right) = tokio::join!(
        handle_a.migrate(
            &fileset_a,
            dst_a.path().to_str().unwrap(),
            SourceDisposition::KeepSource,
            TransferMode::Mmap,
        ),
        handle_b.migrate(
            &fileset_b,
            dst_b.path().to_str().unwrap(),
            SourceDisposition::KeepSource,
            TransferMode::Chunked,
        ),
    );
    left?;
    right?;
    testutils::check_trees_identical(src_a.path(), dst_a.path()).await;
    testutils::check_trees_identical(src_b.path(), dst_b.path()).await;
    drop(handle_a);
    drop(handle_b);
    assert_eq!(client.provider_handle_count(), 0);
    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn callbacks_see_fileset_metadata() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a", "a")]);
    let service = Service::bind("127.0.0.1:0").await.unwrap();
    let provider = service.register_provider(1).unwrap();
    let seen = Arc::new(std::sync::Mutex::new(None::<String>));
    let seen_in_callback = seen.clone();
    provider
        .register_migration_class(
            "c",
            PROVIDER_ID_ANY,
            MigrationClass::new().on_after(move |fileset| {
                *seen_in_callback.lock().unwrap() =
                    fileset.get_metadata("generation").map(str::to_string);
                0
            }),
        )
        .unwrap();
    let mut fileset = fileset_with_files("c", src.path(), &["a"]);
    fileset.register_metadata("generation", "42")?;
    migrate(
        &addr_of(&service),
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Mmap,
    )
    .await?;
    assert_eq!(seen.lock().unwrap().as_deref(), Some("42"));
    Ok(())
}

#[tokio::test]
async fn class_registration_lifecycle() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a", "a")]);
    let service = Service::bind("127.0.0.1:0").await.unwrap();
    let provider = service.register_provider(1).unwrap();
    let dropped = Arc::new(AtomicI32::new(0));
    let state = DropProbe(dropped.clone());
    provider
        .register_migration_class(
            "c",
            PROVIDER_ID_ANY,
            MigrationClass::new().on_before(move |_| {
                let _state = &state;
                0
            }),
        )
        .unwrap();
    // duplicate registration fails
    assert!(matches!(
        provider.register_migration_class("c", PROVIDER_ID_ANY, MigrationClass::new()),
        Err(Error::ClassExists)
    ));
    let fileset = fileset_with_files("c", src.path(), &["a"]);
    migrate(
        &addr_of(&service),
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Chunked,
    )
    .await?;
    // deregistration drops the callback-owned state
    provider.deregister_migration_class("c", PROVIDER_ID_ANY)?;
    assert!(matches!(
        provider.deregister_migration_class("c", PROVIDER_ID_ANY),
        Err(Error::UnknownClass)
    ));
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    let dst2 = tempfile::tempdir()?;
    let result = migrate(
        &addr_of(&service),
        &fileset,
        dst2.path(),
        SourceDisposition::KeepSource,
        TransferMode::Chunked,
    )
    .await;
    assert!(matches!(result, Err(Error::UnknownClass)));
    Ok(())
}

struct DropProbe(Arc<AtomicI32>);

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn provider_identity_is_checked() -> anyhow::Result<()> {
    let (service, addr) = start_service(&["c"]).await;
    let client = Client::new();
    // unknown provider id fails the handshake
    let result = client.provider_handle(&addr, 9).await;
    assert!(matches!(result, Err(Error::UnknownProvider)));
    assert!(service.provider_registered(1));
    assert!(!service.provider_registered(9));
    Ok(())
}

#[tokio::test]
async fn provider_lifecycle() -> anyhow::Result<()> {
    let service = Service::bind("127.0.0.1:0").await.unwrap();
    service.register_provider(1).unwrap();
    assert!(matches!(
        service.register_provider(1),
        Err(Error::InvalidArg(_))
    ));
    service.destroy_provider(1)?;
    assert!(!service.provider_registered(1));
    assert!(matches!(
        service.destroy_provider(1),
        Err(Error::UnknownProvider)
    ));
    Ok(())
}

#[tokio::test]
async fn missing_source_file_fails_before_any_transfer() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("real", "r")]);
    let (_service, addr) = start_service(&["c"]).await;
    let fileset = fileset_with_files("c", src.path(), &["real", "phantom"]);
    let result = migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Mmap,
    )
    .await;
    assert!(matches!(result, Err(Error::UnknownFile(_))));
    assert!(!dst.path().join("real").exists());
    Ok(())
}

#[tokio::test]
async fn hdd_devices_serialize_without_changing_results() -> anyhow::Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    testutils::populate(src.path(), &[("a", "alpha"), ("b", "beta")]);
    common::device::set_device(dst.path().to_str().unwrap(), common::device::DeviceKind::Hdd)?;
    let (_service, addr) = start_service(&["c"]).await;
    let mut fileset = fileset_with_files("c", src.path(), &["a", "b"]);
    fileset.set_xfer_size(2)?;
    migrate(
        &addr,
        &fileset,
        dst.path(),
        SourceDisposition::KeepSource,
        TransferMode::Chunked,
    )
    .await?;
    testutils::check_trees_identical(src.path(), dst.path()).await;
    Ok(())
}

#[tokio::test]
async fn remote_shutdown_stops_the_service() -> anyhow::Result<()> {
    let (service, addr) = start_service(&["c"]).await;
    let client = Client::new();
    client.shutdown_service(&addr).await?;
    tokio::time::timeout(std::time::Duration::from_secs(5), service.wait())
        .await
        .expect("service did not observe the shutdown request");
    Ok(())
}
