//! 端到端同步场景：同步地驱动 `reconcile` + `drain`，不依赖文件监听
#![cfg(unix)]

use lazymirror_lib::core::{walk, ChangeEvent, ChangeKind, PathState, SyncTask};
use lazymirror_lib::{IgnoreRules, Side, SyncConfig, SyncEngine, TuningConfig};
use std::fs::{self, FileTimes};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    remote: PathBuf,
    local: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        let local = dir.path().join("local");
        fs::create_dir_all(&remote).unwrap();
        fs::create_dir_all(&local).unwrap();
        Self {
            _dir: dir,
            remote,
            local,
        }
    }

    fn config(&self) -> SyncConfig {
        SyncConfig::new(&self.remote, &self.local)
    }

    fn engine(&self, config: SyncConfig) -> SyncEngine {
        SyncEngine::new(config).unwrap()
    }
}

fn write(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn set_mtime(path: &Path, secs: u64) {
    let t = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_times(FileTimes::new().set_modified(t).set_accessed(t))
        .unwrap();
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// 反复扫描执行直到没有新任务，返回轮数
fn sync_until_stable(engine: &mut SyncEngine) -> usize {
    for round in 1..=5 {
        let queued = engine.reconcile().unwrap();
        engine.drain();
        if queued == 0 {
            return round;
        }
    }
    panic!("同步没有收敛");
}

fn access(engine: &SyncEngine, path: PathBuf) {
    engine
        .sender()
        .push(SyncTask::Event(ChangeEvent::new(path, ChangeKind::Access, false)));
}

#[test]
fn remote_tree_becomes_local_placeholders() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.remote.join("a/b")).unwrap();
    write(&fx.remote.join("a/b/data.bin"), b"0123456789");

    let mut engine = fx.engine(fx.config());
    assert!(engine.reconcile().unwrap() > 0);
    engine.drain();

    assert!(fx.local.join("a/b").is_dir());
    let placeholder = fx.local.join("a/b/data.bin");
    assert!(is_symlink(&placeholder));
    assert_eq!(fs::read_link(&placeholder).unwrap(), fx.remote.join("a/b/data.bin"));
    assert_eq!(fs::read(&placeholder).unwrap(), b"0123456789");
    assert_eq!(
        engine.path_state(Path::new("a/b/data.bin")),
        PathState::RemoteSymlink
    );

    // 第二轮扫描没有新任务
    assert_eq!(engine.reconcile().unwrap(), 0);
    assert_eq!(engine.pending(), 0);
}

#[test]
fn local_file_uploaded_with_times() {
    let fx = Fixture::new();
    let local_file = fx.local.join("notes/today.txt");
    write(&local_file, b"hello");
    set_mtime(&local_file, 1_600_000_000);

    let mut engine = fx.engine(fx.config());
    sync_until_stable(&mut engine);

    let remote_file = fx.remote.join("notes/today.txt");
    assert_eq!(fs::read(&remote_file).unwrap(), b"hello");
    assert!(!is_symlink(&remote_file));
    let mtime = fs::metadata(&remote_file).unwrap().modified().unwrap();
    assert_eq!(
        mtime,
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000)
    );
    assert_eq!(
        engine.path_state(Path::new("notes/today.txt")),
        PathState::TrackedEqual
    );
}

#[test]
fn eager_mode_downloads_immediately() {
    let fx = Fixture::new();
    let remote_file = fx.remote.join("big.dat");
    write(&remote_file, &vec![7u8; 4096]);
    set_mtime(&remote_file, 1_500_000_000);

    let mut engine = fx.engine(fx.config().with_lazy(false));
    sync_until_stable(&mut engine);

    let local_file = fx.local.join("big.dat");
    assert!(!is_symlink(&local_file));
    assert_eq!(fs::read(&local_file).unwrap().len(), 4096);
    assert_eq!(
        fs::metadata(&local_file).unwrap().modified().unwrap(),
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000)
    );
    assert_eq!(engine.stats().materialized, 1);
}

#[test]
fn repeated_access_materializes_placeholder() {
    let fx = Fixture::new();
    write(&fx.remote.join("f.bin"), b"0123456789");

    // 10 字节文件，每次访问约 4 字节，阈值 4.5 字节
    let tuning = TuningConfig {
        chunk_size: 4,
        ..TuningConfig::default()
    };
    let mut engine = fx.engine(fx.config().with_tuning(tuning));
    engine.reconcile().unwrap();
    engine.drain();
    let local_file = fx.local.join("f.bin");
    assert!(is_symlink(&local_file));

    access(&engine, fx.remote.join("f.bin"));
    engine.drain();
    assert!(is_symlink(&local_file));

    access(&engine, fx.remote.join("f.bin"));
    engine.drain();
    assert!(!is_symlink(&local_file));
    assert_eq!(fs::read(&local_file).unwrap(), b"0123456789");
    assert_eq!(engine.stats().materialized, 1);

    // 占位链接删除时不产生备份
    assert_eq!(engine.backups(Side::Local).entries().count(), 0);
    assert_eq!(engine.reconcile().unwrap(), 0);
}

#[test]
fn local_access_events_are_ignored() {
    let fx = Fixture::new();
    write(&fx.remote.join("f.bin"), b"x");
    let mut engine = fx.engine(fx.config());
    sync_until_stable(&mut engine);

    access(&engine, fx.local.join("f.bin"));
    engine.drain();
    assert!(is_symlink(&fx.local.join("f.bin")));
    assert_eq!(engine.stats().materialized, 0);
}

#[test]
fn local_delete_backs_up_remote() {
    let fx = Fixture::new();
    write(&fx.local.join("report.txt"), b"quarterly");
    let mut engine = fx.engine(fx.config());
    sync_until_stable(&mut engine);
    let remote_file = fx.remote.join("report.txt");
    assert!(remote_file.is_file());

    fs::remove_file(fx.local.join("report.txt")).unwrap();
    sync_until_stable(&mut engine);

    assert!(!remote_file.exists());
    let records = engine.backups(Side::Remote).records(&remote_file);
    assert_eq!(records.len(), 1);
    assert_eq!(fs::read(&records[0].backup_file).unwrap(), b"quarterly");
    assert!(!engine.tracked().contains(Path::new("report.txt")));
}

#[test]
fn remote_delete_removes_placeholder_without_backup() {
    let fx = Fixture::new();
    write(&fx.remote.join("dir/item.txt"), b"item");
    let mut engine = fx.engine(fx.config());
    sync_until_stable(&mut engine);
    assert!(is_symlink(&fx.local.join("dir/item.txt")));

    fs::remove_dir_all(fx.remote.join("dir")).unwrap();
    sync_until_stable(&mut engine);

    assert!(fs::symlink_metadata(fx.local.join("dir")).is_err());
    assert_eq!(engine.backups(Side::Local).entries().count(), 0);
    assert!(engine.tracked().is_empty());
}

#[test]
fn newer_remote_wins_and_local_is_backed_up() {
    let fx = Fixture::new();
    let remote_file = fx.remote.join("c.txt");
    let local_file = fx.local.join("c.txt");
    write(&remote_file, b"remote version");
    write(&local_file, b"local");
    set_mtime(&remote_file, 2_000_000_000);
    set_mtime(&local_file, 1_000_000_000);

    let mut engine = fx.engine(fx.config());
    sync_until_stable(&mut engine);

    assert!(is_symlink(&local_file));
    let newest = engine.backups(Side::Local).newest(&local_file).unwrap();
    assert_eq!(fs::read(&newest.backup_file).unwrap(), b"local");
}

#[test]
fn newer_local_wins_and_remote_is_backed_up() {
    let fx = Fixture::new();
    let remote_file = fx.remote.join("c.txt");
    let local_file = fx.local.join("c.txt");
    write(&remote_file, b"remote");
    write(&local_file, b"local edit");
    set_mtime(&remote_file, 1_000_000_000);
    set_mtime(&local_file, 2_000_000_000);

    let mut engine = fx.engine(fx.config());
    sync_until_stable(&mut engine);

    assert_eq!(fs::read(&remote_file).unwrap(), b"local edit");
    let records = engine.backups(Side::Remote).records(&remote_file);
    assert_eq!(records.len(), 1);
    assert_eq!(fs::read(&records[0].backup_file).unwrap(), b"remote");
}

#[test]
fn intra_tree_symlink_mirrored_as_relative() {
    let fx = Fixture::new();
    write(&fx.local.join("target.txt"), b"t");
    std::os::unix::fs::symlink("target.txt", fx.local.join("link")).unwrap();

    let mut engine = fx.engine(fx.config());
    sync_until_stable(&mut engine);

    let remote_link = fx.remote.join("link");
    assert!(is_symlink(&remote_link));
    assert_eq!(fs::read_link(&remote_link).unwrap(), PathBuf::from("target.txt"));
    assert_eq!(fs::read(&remote_link).unwrap(), b"t");
}

#[test]
fn remote_link_outside_tree_gets_placeholder() {
    let fx = Fixture::new();
    let remote_link = fx.remote.join("ext");
    std::os::unix::fs::symlink("/mnt/not-mounted/data", &remote_link).unwrap();

    for lazy in [true, false] {
        let mut engine = fx.engine(fx.config().with_lazy(lazy));
        sync_until_stable(&mut engine);

        // 失效的远程链接保持原样
        assert_eq!(
            fs::read_link(&remote_link).unwrap(),
            PathBuf::from("/mnt/not-mounted/data")
        );
        let local_link = fx.local.join("ext");
        assert_eq!(fs::read_link(&local_link).unwrap(), remote_link);
        assert_eq!(engine.path_state(Path::new("ext")), PathState::RemoteSymlink);
    }
}

#[test]
fn dry_run_changes_nothing() {
    let fx = Fixture::new();
    write(&fx.remote.join("r.txt"), b"r");
    write(&fx.local.join("l.txt"), b"l");

    let mut engine = fx.engine(fx.config().with_dry_run(true));
    let first = engine.reconcile().unwrap();
    engine.drain();

    assert!(fs::symlink_metadata(fx.local.join("r.txt")).is_err());
    assert!(!fx.remote.join("l.txt").exists());
    assert!(engine.tracked().is_empty());
    assert_eq!(engine.reconcile().unwrap(), first);
}

#[test]
fn ignored_paths_stay_put() {
    let fx = Fixture::new();
    write(&fx.local.join("build/out.o"), b"obj");
    write(&fx.local.join("src/main.c"), b"int main;");
    write(&fx.local.join("src/main.c.tmp"), b"scratch");

    let mut ignore = IgnoreRules::new();
    ignore.add("build").unwrap();
    ignore.add("*.tmp").unwrap();
    let mut engine = fx.engine(fx.config().with_ignore(ignore));
    sync_until_stable(&mut engine);

    assert!(fx.remote.join("src/main.c").is_file());
    assert!(!fx.remote.join("build").exists());
    assert!(!fx.remote.join("src/main.c.tmp").exists());
}

#[test]
fn mixed_trees_converge() {
    let fx = Fixture::new();
    write(&fx.remote.join("shared/a.txt"), b"a");
    write(&fx.remote.join("only-remote/r.txt"), b"r");
    write(&fx.local.join("shared/b.txt"), b"b");
    write(&fx.local.join("only-local/deep/l.txt"), b"l");
    fs::create_dir_all(fx.local.join("empty")).unwrap();

    let mut engine = fx.engine(fx.config());
    let rounds = sync_until_stable(&mut engine);
    assert!(rounds <= 3);

    let rules = IgnoreRules::new();
    let remote = walk(&fx.remote, &rules).unwrap();
    let local = walk(&fx.local, &rules).unwrap();
    assert_eq!(remote.folders, local.folders);
    assert_eq!(remote.files, local.files);
    assert_eq!(engine.tracked().len(), remote.len());
    assert!(!remote.folders.contains(Path::new(".lazymirror")));
    assert_eq!(engine.reconcile().unwrap(), 0);
}
