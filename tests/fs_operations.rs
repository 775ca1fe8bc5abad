//! End-to-end tests: a cluster of in-process daemons on loopback sockets,
//! driven through the client operation layer.

use std::sync::Arc;

use scratchfs::client::{file_ops, ClientContext, FileKind, OpenFlags};
use scratchfs::daemon::{self, DaemonContext, DaemonSettings};
use scratchfs::distributor::Distributor;
use scratchfs::error::FsError;
use scratchfs::hosts::Host;

struct Cluster {
    hosts: Vec<Host>,
    client: ClientContext,
    daemons: Vec<Arc<DaemonContext>>,
    roots: Vec<tempfile::TempDir>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Cluster {
    async fn start(nodes: usize, chunk_size: u64) -> Cluster {
        let mut listeners = Vec::new();
        let mut hosts = Vec::new();
        for i in 0..nodes {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            hosts.push(Host {
                name: format!("node{}", i),
                addr: listener.local_addr().unwrap().to_string(),
            });
            listeners.push(listener);
        }

        let mut daemons = Vec::new();
        let mut roots = Vec::new();
        let mut tasks = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let root = tempfile::tempdir().unwrap();
            let settings = DaemonSettings {
                rootdir: root.path().to_path_buf(),
                metadir: None,
                mountdir: "/".to_string(),
                chunk_size,
            };
            let distributor = Distributor::hash(i as u64, nodes as u64);
            let ctx = DaemonContext::init(settings, distributor).unwrap();
            let serve_ctx = Arc::clone(&ctx);
            tasks.push(tokio::spawn(async move {
                let _ = daemon::serve(listener, serve_ctx).await;
            }));
            daemons.push(ctx);
            roots.push(root);
        }

        let client = ClientContext::new(hosts.clone()).await.unwrap();
        Cluster {
            hosts,
            client,
            daemons,
            roots,
            tasks,
        }
    }

    /// A second, independent client against the same daemons.
    async fn another_client(&self) -> ClientContext {
        ClientContext::new(self.hosts.clone()).await.unwrap()
    }

    /// All `(chunk_id, file_size)` pairs found on disk across the cluster.
    fn chunk_files(&self) -> Vec<(u64, u64)> {
        let mut found = Vec::new();
        for root in &self.roots {
            let data = root.path().join("data");
            let dirs = match std::fs::read_dir(&data) {
                Ok(dirs) => dirs,
                Err(_) => continue,
            };
            for dir in dirs {
                let dir = dir.unwrap();
                for chunk in std::fs::read_dir(dir.path()).unwrap() {
                    let chunk = chunk.unwrap();
                    let id: u64 = chunk.file_name().to_str().unwrap().parse().unwrap();
                    found.push((id, chunk.metadata().unwrap().len()));
                }
            }
        }
        found.sort_unstable();
        found
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for daemon in &self.daemons {
            let _ = daemon.shutdown();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_chunk_write_read() {
    let cluster = Cluster::start(1, 524288).await;
    let c = &cluster.client;

    let mut data = vec![b'2'; 40];
    data[0] = b'1';
    data[39] = b'1';

    let fd = file_ops::open(c, "/a", 0o644, OpenFlags::CREAT | OpenFlags::RDWR)
        .await
        .unwrap();
    assert_eq!(file_ops::pwrite(c, fd, &data, 0).await.unwrap(), 40);

    let mut back = vec![0u8; 40];
    assert_eq!(file_ops::pread(c, fd, &mut back, 0).await.unwrap(), 40);
    assert_eq!(back, data);

    let md = file_ops::stat(c, "/a", true).await.unwrap();
    assert_eq!(md.size(), 40);

    file_ops::close(c, fd).unwrap();
    assert!(matches!(
        file_ops::close(c, fd),
        Err(FsError::BadDescriptor)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_chunk_write_spans_daemons() {
    let cluster = Cluster::start(3, 64).await;
    let c = &cluster.client;

    let data: Vec<u8> = (0..192u32).map(|i| (i % 251) as u8).collect();
    let fd = file_ops::open(c, "/spread", 0o644, OpenFlags::CREAT | OpenFlags::RDWR)
        .await
        .unwrap();
    assert_eq!(file_ops::pwrite(c, fd, &data, 0).await.unwrap(), 192);

    // three full chunk files exist somewhere in the cluster
    assert_eq!(
        cluster.chunk_files(),
        vec![(0, 64), (1, 64), (2, 64)]
    );

    let mut back = vec![0u8; 192];
    assert_eq!(file_ops::pread(c, fd, &mut back, 0).await.unwrap(), 192);
    assert_eq!(back, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_final_chunk() {
    let cluster = Cluster::start(3, 64).await;
    let c = &cluster.client;

    let data = vec![0xabu8; 160];
    let fd = file_ops::open(c, "/partial", 0o644, OpenFlags::CREAT | OpenFlags::WRONLY)
        .await
        .unwrap();
    assert_eq!(file_ops::pwrite(c, fd, &data, 0).await.unwrap(), 160);

    assert_eq!(
        cluster.chunk_files(),
        vec![(0, 64), (1, 64), (2, 32)]
    );
    let md = file_ops::stat(c, "/partial", true).await.unwrap();
    assert_eq!(md.size(), 160);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unaligned_offsets_roundtrip() {
    let cluster = Cluster::start(2, 64).await;
    let c = &cluster.client;

    let data: Vec<u8> = (0..200u32).map(|i| (i % 241) as u8).collect();
    let fd = file_ops::open(c, "/offset", 0o644, OpenFlags::CREAT | OpenFlags::RDWR)
        .await
        .unwrap();
    // starts mid-chunk, ends mid-chunk
    assert_eq!(file_ops::pwrite(c, fd, &data, 37).await.unwrap(), 200);

    let md = file_ops::stat(c, "/offset", true).await.unwrap();
    assert_eq!(md.size(), 237);

    let mut back = vec![0u8; 200];
    assert_eq!(file_ops::pread(c, fd, &mut back, 37).await.unwrap(), 200);
    assert_eq!(back, data);

    // the unwritten head reads as zeroes
    let mut head = vec![0xffu8; 37];
    assert_eq!(file_ops::pread(c, fd, &mut head, 0).await.unwrap(), 37);
    assert_eq!(head, vec![0u8; 37]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_to_smaller() {
    let cluster = Cluster::start(2, 64).await;
    let c = &cluster.client;

    let data = vec![b'x'; 1024];
    let fd = file_ops::open(c, "/trunc", 0o644, OpenFlags::CREAT | OpenFlags::RDWR)
        .await
        .unwrap();
    assert_eq!(file_ops::pwrite(c, fd, &data, 0).await.unwrap(), 1024);

    file_ops::truncate(c, "/trunc", 2).await.unwrap();
    let md = file_ops::stat(c, "/trunc", true).await.unwrap();
    assert_eq!(md.size(), 2);

    // bytes beyond the new size are gone
    let mut back = vec![0u8; 1024];
    assert_eq!(file_ops::pread(c, fd, &mut back, 0).await.unwrap(), 2);
    assert_eq!(&back[..2], b"xx");
    assert_eq!(cluster.chunk_files(), vec![(0, 2)]);

    // growing through truncate is rejected
    assert!(file_ops::truncate(c, "/trunc", 4096).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_preserve_both_ranges() {
    let cluster = Cluster::start(2, 64).await;
    let c1 = &cluster.client;
    let c2 = cluster.another_client().await;

    file_ops::create(c1, "/log", 0o644).await.unwrap();
    let fd1 = file_ops::open(c1, "/log", 0o644, OpenFlags::WRONLY | OpenFlags::APPEND)
        .await
        .unwrap();
    let fd2 = file_ops::open(&c2, "/log", 0o644, OpenFlags::WRONLY | OpenFlags::APPEND)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        file_ops::write(c1, fd1, &[b'A'; 10]),
        file_ops::write(&c2, fd2, &[b'B'; 10]),
    );
    assert_eq!(a.unwrap(), 10);
    assert_eq!(b.unwrap(), 10);

    let md = file_ops::stat(c1, "/log", true).await.unwrap();
    assert_eq!(md.size(), 20);

    let fd = file_ops::open(c1, "/log", 0o644, OpenFlags::RDONLY).await.unwrap();
    let mut back = vec![0u8; 20];
    assert_eq!(file_ops::pread(c1, fd, &mut back, 0).await.unwrap(), 20);
    // both appends landed in full; their order is unspecified
    assert!(back == [[b'A'; 10], [b'B'; 10]].concat() || back == [[b'B'; 10], [b'A'; 10]].concat());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_listing_fans_out() {
    let cluster = Cluster::start(3, 64).await;
    let c = &cluster.client;

    file_ops::mkdir(c, "/d", 0o755).await.unwrap();
    for name in &["/d/a", "/d/b", "/d/c"] {
        file_ops::create(c, name, 0o644).await.unwrap();
    }
    file_ops::mkdir(c, "/d/sub", 0o755).await.unwrap();

    let fd = file_ops::opendir(c, "/d").await.unwrap();
    let mut names = Vec::new();
    let mut dirs = Vec::new();
    while let Some(entry) = file_ops::readdir(c, fd).unwrap() {
        if entry.kind == FileKind::Directory {
            dirs.push(entry.name.clone());
        }
        names.push(entry.name);
    }
    assert_eq!(names, vec!["a", "b", "c", "sub"]);
    assert_eq!(dirs, vec!["sub"]);

    // rewind through lseek and read the snapshot again
    file_ops::lseek(c, fd, 0, libc::SEEK_SET).await.unwrap();
    assert_eq!(file_ops::readdir(c, fd).unwrap().unwrap().name, "a");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_destroys_record_and_chunks() {
    let cluster = Cluster::start(3, 64).await;
    let c = &cluster.client;

    let data = vec![b'z'; 500];
    let fd = file_ops::open(c, "/victim", 0o644, OpenFlags::CREAT | OpenFlags::WRONLY)
        .await
        .unwrap();
    assert_eq!(file_ops::pwrite(c, fd, &data, 0).await.unwrap(), 500);
    assert!(!cluster.chunk_files().is_empty());

    file_ops::unlink(c, "/victim").await.unwrap();
    assert!(matches!(
        file_ops::stat(c, "/victim", true).await,
        Err(FsError::NotFound)
    ));
    assert!(cluster.chunk_files().is_empty());

    assert!(matches!(
        file_ops::unlink(c, "/victim").await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rmdir_requires_empty() {
    let cluster = Cluster::start(2, 64).await;
    let c = &cluster.client;

    file_ops::mkdir(c, "/dir", 0o755).await.unwrap();
    file_ops::create(c, "/dir/f", 0o644).await.unwrap();

    assert!(matches!(
        file_ops::rmdir(c, "/dir").await,
        Err(FsError::NotEmpty)
    ));

    file_ops::unlink(c, "/dir/f").await.unwrap();
    file_ops::rmdir(c, "/dir").await.unwrap();
    assert!(matches!(
        file_ops::stat(c, "/dir", true).await,
        Err(FsError::NotFound)
    ));

    // creating under a missing parent is refused
    assert!(matches!(
        file_ops::create(c, "/dir/g", 0o644).await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_semantics() {
    let cluster = Cluster::start(1, 64).await;
    let c = &cluster.client;

    // plain open of a missing file fails
    assert!(matches!(
        file_ops::open(c, "/missing", 0o644, OpenFlags::RDONLY).await,
        Err(FsError::NotFound)
    ));

    let fd = file_ops::open(c, "/f", 0o644, OpenFlags::CREAT | OpenFlags::RDWR)
        .await
        .unwrap();
    assert_eq!(file_ops::pwrite(c, fd, b"hello", 0).await.unwrap(), 5);

    // exclusive create on an existing path
    assert!(matches!(
        file_ops::open(
            c,
            "/f",
            0o644,
            OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::RDWR
        )
        .await,
        Err(FsError::AlreadyExists)
    ));

    // O_TRUNC drops the content
    let fd2 = file_ops::open(c, "/f", 0o644, OpenFlags::TRUNC | OpenFlags::WRONLY)
        .await
        .unwrap();
    assert_eq!(
        file_ops::stat(c, "/f", true).await.unwrap().size(),
        0
    );
    file_ops::close(c, fd2).unwrap();

    // positions move with read/write/lseek and are shared across dup
    assert_eq!(file_ops::write(c, fd, b"0123456789").await.unwrap(), 10);
    let dup = file_ops::dup(c, fd).unwrap();
    assert_eq!(file_ops::lseek(c, dup, 0, libc::SEEK_SET).await.unwrap(), 0);
    let mut back = vec![0u8; 4];
    assert_eq!(file_ops::read(c, fd, &mut back).await.unwrap(), 4);
    assert_eq!(&back, b"0123");
    assert_eq!(file_ops::lseek(c, dup, 0, libc::SEEK_CUR).await.unwrap(), 4);
    assert_eq!(
        file_ops::lseek(c, fd, 0, libc::SEEK_END).await.unwrap(),
        10
    );
}

#[cfg(feature = "symlinks")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn symlinks_resolve_and_read_back() {
    let cluster = Cluster::start(2, 64).await;
    let c = &cluster.client;

    let fd = file_ops::open(c, "/data", 0o644, OpenFlags::CREAT | OpenFlags::WRONLY)
        .await
        .unwrap();
    assert_eq!(file_ops::pwrite(c, fd, b"payload", 0).await.unwrap(), 7);

    file_ops::mk_symlink(c, "/link", "/data").await.unwrap();
    assert!(matches!(
        file_ops::mk_symlink(c, "/link", "/data").await,
        Err(FsError::AlreadyExists)
    ));

    assert_eq!(file_ops::readlink(c, "/link").await.unwrap(), "/data");

    // stat follows the link, lstat-style does not
    let followed = file_ops::stat(c, "/link", true).await.unwrap();
    assert_eq!(followed.size(), 7);
    let raw = file_ops::stat(c, "/link", false).await.unwrap();
    assert!(raw.is_link());

    // opening the link opens the target
    let lfd = file_ops::open(c, "/link", 0o644, OpenFlags::RDONLY).await.unwrap();
    let mut back = vec![0u8; 7];
    assert_eq!(file_ops::pread(c, lfd, &mut back, 0).await.unwrap(), 7);
    assert_eq!(&back, b"payload");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statfs_aggregates_capacity() {
    let cluster = Cluster::start(3, 1024).await;
    let c = &cluster.client;

    let stat = file_ops::statfs(c).await.unwrap();
    assert_eq!(stat.chunk_size, 1024);
    assert!(stat.chunk_total > 0);
    assert!(stat.chunk_free <= stat.chunk_total);

    // three daemons on the same backing fs: the sum is about three times
    // one daemon's view
    let one = cluster.daemons[0].storage().chunk_stat().unwrap();
    assert!(stat.chunk_total >= one.chunk_total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chmod_updates_stored_mode() {
    let cluster = Cluster::start(1, 64).await;
    let c = &cluster.client;

    file_ops::create(c, "/m", 0o644).await.unwrap();
    file_ops::chmod(c, "/m", 0o600).await.unwrap();
    let md = file_ops::stat(c, "/m", true).await.unwrap();
    assert_eq!(md.mode() & !libc::S_IFMT, 0o600);
    assert_eq!(md.mode() & libc::S_IFMT, libc::S_IFREG);
}
