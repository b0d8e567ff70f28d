use execfs_fs::{
    ExecFs, ExecFsConfig, Fault, NodeKind, ReapPolicy, SizePolicy, Target, ENV_PATH,
};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn write_script(dir: &Path, name: &str, body: &str, mode: u32) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    path
}

fn mount(temp: &TempDir) -> ExecFs {
    ExecFs::new(ExecFsConfig {
        backing_root: temp.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap()
}

fn read_all(fs: &ExecFs, handle: u64) -> Vec<u8> {
    let deadline = Instant::now() + WAIT;
    while !fs.is_complete(handle).unwrap() {
        assert!(Instant::now() < deadline, "program did not finish");
        thread::sleep(Duration::from_millis(5));
    }
    fs.read(handle, 0, 1 << 20).unwrap()
}

fn process_gone(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

#[test]
fn lookup_of_missing_file_is_not_found() {
    let temp = TempDir::new().unwrap();
    let fs = mount(&temp);

    let err = fs.lookup(Path::new("/missing")).expect_err("missing");
    assert!(matches!(err, Fault::NotFound));
    assert_eq!(err.errno(), libc::ENOENT);

    let err = fs.lookup(Path::new("/missing?arg")).expect_err("missing");
    assert!(matches!(err, Fault::NotFound));
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn traversal_above_root_is_refused() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("sub")).unwrap();
    let fs = mount(&temp);

    let err = fs.lookup(Path::new("sub/../../etc")).expect_err("escape");
    assert_eq!(err.errno(), libc::EACCES);
}

#[test]
#[serial]
fn non_executable_file_never_runs() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("ran");
    write_script(
        temp.path(),
        "notes",
        &format!("touch {}", marker.display()),
        0o644,
    );
    let fs = mount(&temp);

    let attr = fs.lookup(Path::new("notes")).unwrap();
    assert_eq!(attr.kind, NodeKind::File);
    assert_eq!(attr.perm & 0o555, 0);

    for _ in 0..2 {
        let err = fs.open(Path::new("notes"), libc::O_RDONLY).expect_err("not executable");
        assert_eq!(err.errno(), libc::EACCES);
    }
    assert!(!marker.exists());
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn hidden_non_executables_do_not_exist() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "notes", "true", 0o644);
    write_script(temp.path(), "tool", "true", 0o755);
    let fs = ExecFs::new(ExecFsConfig {
        backing_root: temp.path().to_path_buf(),
        hide_non_executable: true,
        ..Default::default()
    })
    .unwrap();

    assert!(matches!(fs.lookup(Path::new("notes")), Err(Fault::NotFound)));
    let names: Vec<_> = fs
        .readdir(Path::new("/"))
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("tool")]);
}

#[test]
fn attributes_strip_exec_bits_and_report_placeholder_size() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "tool", "printf hi", 0o750);
    fs::create_dir(temp.path().join("dir")).unwrap();
    let backing_size = fs::metadata(&script).unwrap().len();

    let fs = mount(&temp);
    let attr = fs.lookup(Path::new("/tool")).unwrap();
    assert_eq!(attr.kind, NodeKind::File);
    assert_eq!(attr.perm, 0o644);
    assert_eq!(attr.size, backing_size);

    let dir = fs.lookup(Path::new("dir")).unwrap();
    assert_eq!(dir.kind, NodeKind::Directory);

    let zero = ExecFs::new(ExecFsConfig {
        backing_root: temp.path().to_path_buf(),
        size_policy: SizePolicy::Zero,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(zero.lookup(Path::new("tool")).unwrap().size, 0);
}

#[test]
fn readdir_lists_directories_and_files_but_not_reserved_names() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "b-tool", "true", 0o755);
    write_script(temp.path(), "a-notes", "true", 0o644);
    write_script(temp.path(), "odd?name", "true", 0o755);
    fs::create_dir(temp.path().join("c-dir")).unwrap();

    let fs = mount(&temp);
    let listing = fs.readdir(Path::new("")).unwrap();
    let names: Vec<_> = listing
        .iter()
        .map(|e| (e.name.to_string_lossy().into_owned(), e.kind))
        .collect();

    assert_eq!(
        names,
        vec![
            ("a-notes".to_string(), NodeKind::File),
            ("b-tool".to_string(), NodeKind::File),
            ("c-dir".to_string(), NodeKind::Directory),
        ]
    );
    assert!(matches!(
        fs.readdir(Path::new("b-tool")),
        Err(Fault::NotDirectory)
    ));
}

#[test]
#[serial]
fn full_read_after_completion_is_exact_and_idempotent() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "hello", "printf hello", 0o755);
    let fs = mount(&temp);

    let handle = fs.open(Path::new("/hello"), libc::O_RDONLY).unwrap();
    assert_eq!(read_all(&fs, handle), b"hello");
    assert_eq!(fs.read(handle, 0, 1 << 20).unwrap(), b"hello");
    assert_eq!(fs.read(handle, 3, 100).unwrap(), b"lo");
    assert!(fs.read(handle, 100, 100).unwrap().is_empty());

    let attr = fs.getattr(Path::new("/hello"), Some(handle)).unwrap();
    assert_eq!(attr.size, 5);

    let status = fs.release(handle).unwrap();
    assert!(status.success());
    assert_eq!(fs.open_handles(), 0);
    assert!(matches!(fs.read(handle, 0, 10), Err(Fault::BadHandle(_))));
}

#[test]
#[serial]
fn concurrent_opens_get_independent_sessions() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "whoami", r#"printf '%s' "$$""#, 0o755);
    let fs = mount(&temp);

    let a = fs.open(Path::new("whoami"), libc::O_RDONLY).unwrap();
    let b = fs.open(Path::new("whoami"), libc::O_RDONLY).unwrap();
    assert_ne!(a, b);

    let out_a = read_all(&fs, a);
    let out_b = read_all(&fs, b);
    assert_eq!(out_a, fs.pid(a).unwrap().to_string().into_bytes());
    assert_eq!(out_b, fs.pid(b).unwrap().to_string().into_bytes());
    assert_ne!(out_a, out_b);

    fs.release(a).unwrap();
    fs.release(b).unwrap();
}

#[test]
#[serial]
fn arguments_in_the_name_reach_the_program() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "show", r#"printf '[%s]' "$@""#, 0o755);
    let fs = mount(&temp);

    let handle = fs
        .open(Path::new("show?one&a%26b&x%2Fy"), libc::O_RDONLY)
        .unwrap();
    assert_eq!(read_all(&fs, handle), b"[one][a&b][x/y]");
    fs.release(handle).unwrap();

    let err = fs
        .open(Path::new("show?bad%zz"), libc::O_RDONLY)
        .expect_err("malformed");
    assert_eq!(err.errno(), libc::EINVAL);
}

#[test]
#[serial]
fn written_input_reaches_the_program() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "echo", "cat", 0o755);
    let fs = mount(&temp);

    let handle = fs.open(Path::new("echo"), libc::O_RDWR).unwrap();
    assert_eq!(fs.write(handle, 0, b"ping").unwrap(), 4);
    fs.flush(handle).unwrap();

    let output = read_all(&fs, handle);
    assert!(output.windows(4).any(|w| w == b"ping"));

    // Accepted and dropped once the program is gone.
    assert_eq!(fs.write(handle, 4, b"late").unwrap(), 4);
    fs.release(handle).unwrap();
}

#[test]
#[serial]
fn read_only_open_gives_the_program_empty_stdin() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "count", "wc -c", 0o755);
    let fs = mount(&temp);

    let handle = fs.open(Path::new("count"), libc::O_RDONLY).unwrap();
    let output = String::from_utf8(read_all(&fs, handle)).unwrap();
    assert_eq!(output.trim(), "0");
    assert!(matches!(
        fs.write(handle, 0, b"x"),
        Err(Fault::PermissionDenied(_))
    ));
    fs.release(handle).unwrap();

    let handle = fs.open(Path::new("count??"), libc::O_RDWR).unwrap();
    let output = String::from_utf8(read_all(&fs, handle)).unwrap();
    assert_eq!(output.trim(), "0");
    fs.release(handle).unwrap();
}

#[test]
#[serial]
fn release_reaps_a_running_program() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "forever", "while :; do sleep 1; done", 0o755);
    let fs = mount(&temp);

    let handle = fs.open(Path::new("forever"), libc::O_RDONLY).unwrap();
    let pid = fs.pid(handle).unwrap();
    assert!(!fs.is_complete(handle).unwrap());

    let status = fs.release(handle).unwrap();
    assert!(!status.success());
    assert!(process_gone(pid));
    assert!(matches!(fs.release(handle), Err(Fault::BadHandle(_))));
}

#[test]
#[serial]
fn release_is_not_held_up_by_a_blocked_write() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "deaf", "exec sleep 30", 0o755);
    let fs = mount(&temp);

    let handle = fs.open(Path::new("deaf"), libc::O_WRONLY).unwrap();
    let pid = fs.pid(handle).unwrap();

    thread::scope(|scope| {
        let writer = scope.spawn(|| fs.write(handle, 0, &vec![b'x'; 1 << 20]));
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let status = fs.release(handle).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!status.success());
        assert!(process_gone(pid));

        // The blocked write ends with the program and reports the data as taken.
        assert_eq!(writer.join().unwrap().unwrap(), 1 << 20);
    });
    assert_eq!(fs.open_handles(), 0);
}

#[test]
#[serial]
fn parallel_readers_always_see_a_prefix_of_the_output() {
    let temp = TempDir::new().unwrap();
    write_script(
        temp.path(),
        "count",
        r#"i=0; while [ $i -lt 3000 ]; do echo "line $i"; i=$((i+1)); done"#,
        0o755,
    );
    let fs = mount(&temp);
    let handle = fs.open(Path::new("count"), libc::O_RDONLY).unwrap();

    let snapshots: Vec<Vec<Vec<u8>>> = thread::scope(|scope| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let mut seen = Vec::new();
                    let deadline = Instant::now() + WAIT;
                    loop {
                        let done = fs.is_complete(handle).unwrap();
                        seen.push(fs.read(handle, 0, 1 << 20).unwrap());
                        if done || Instant::now() >= deadline {
                            return seen;
                        }
                    }
                })
            })
            .collect();
        readers.into_iter().map(|r| r.join().unwrap()).collect()
    });

    let output = read_all(&fs, handle);
    let expected: String = (0..3000).map(|i| format!("line {}\n", i)).collect();
    assert_eq!(output, expected.as_bytes());

    for seen in &snapshots {
        assert_eq!(seen.last().unwrap(), &output);
        for pair in seen.windows(2) {
            assert!(pair[0].len() <= pair[1].len());
        }
        for snapshot in seen {
            assert!(output.starts_with(snapshot));
        }
    }
    fs.release(handle).unwrap();
}

#[test]
#[serial]
fn read_while_running_returns_available_prefix() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "slow", "printf abc; exec sleep 30", 0o755);
    let fs = mount(&temp);

    let handle = fs.open(Path::new("slow"), libc::O_RDONLY).unwrap();
    let prefix = fs
        .read_wait(handle, 0, 3, WAIT)
        .unwrap();
    assert_eq!(prefix, b"abc");

    assert_eq!(fs.read(handle, 0, 4096).unwrap(), b"abc");
    assert!(fs.read(handle, 3, 4096).unwrap().is_empty());
    assert!(!fs.is_complete(handle).unwrap());
    assert_eq!(fs.exit_status(handle).unwrap(), None);

    let started = Instant::now();
    let waited = fs
        .read_wait(handle, 0, 4096, Duration::from_millis(50))
        .unwrap();
    assert_eq!(waited, b"abc");
    assert!(started.elapsed() >= Duration::from_millis(50));

    fs.release(handle).unwrap();
}

#[test]
#[serial]
fn failing_program_output_is_still_served() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "broken", "echo oops >&2; exit 7", 0o755);
    let fs = mount(&temp);

    let handle = fs.open(Path::new("broken"), libc::O_RDONLY).unwrap();
    assert_eq!(read_all(&fs, handle), b"oops\n");
    assert_eq!(fs.exit_status(handle).unwrap().unwrap().code(), Some(7));
    assert_eq!(fs.release(handle).unwrap().code(), Some(7));
}

#[test]
#[serial]
fn spawn_failure_is_an_io_error_on_open() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("no-interpreter");
    fs::write(&path, "#!/nonexistent/interpreter\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    let fs = mount(&temp);

    let err = fs
        .open(Path::new("no-interpreter"), libc::O_RDONLY)
        .expect_err("cannot exec");
    assert!(matches!(err, Fault::Exec(_)));
    assert_eq!(err.errno(), libc::EIO);
    assert_eq!(fs.open_handles(), 0);
}

#[test]
#[serial]
fn programs_run_in_their_directory_with_execfs_environment() {
    let temp = TempDir::new().unwrap();
    let sub = temp.path().join("sub");
    fs::create_dir(&sub).unwrap();
    write_script(
        &sub,
        "where",
        &format!(r#"printf '%s|%s' "${}" "$(pwd -P)""#, ENV_PATH),
        0o755,
    );
    let fs = mount(&temp);

    let handle = fs.open(Path::new("sub/where?x"), libc::O_RDONLY).unwrap();
    let expected = format!("/sub/where|{}", fs::canonicalize(&sub).unwrap().display());
    assert_eq!(read_all(&fs, handle), expected.as_bytes());
    fs.release(handle).unwrap();
}

#[test]
fn read_only_mount_refuses_writers_and_chmod() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "tool", "true", 0o755);
    let fs = ExecFs::new(ExecFsConfig {
        backing_root: temp.path().to_path_buf(),
        read_only: true,
        ..Default::default()
    })
    .unwrap();

    let err = fs.open(Path::new("tool"), libc::O_WRONLY).expect_err("ro");
    assert_eq!(err.errno(), libc::EROFS);
    let err = fs.set_mode(Path::new("tool"), 0o700).expect_err("ro");
    assert_eq!(err.errno(), libc::EROFS);
}

#[test]
fn chmod_passes_through_to_backing_file() {
    let temp = TempDir::new().unwrap();
    let script = write_script(temp.path(), "tool", "true", 0o755);
    let fs = mount(&temp);

    let attr = fs.set_mode(Path::new("tool"), 0o644).unwrap();
    assert_eq!(fs::metadata(&script).unwrap().permissions().mode() & 0o777, 0o644);
    assert_eq!(attr.perm, 0o200);
    assert!(matches!(
        fs.open(Path::new("tool"), libc::O_RDONLY),
        Err(Fault::PermissionDenied(_))
    ));
}

#[test]
#[serial]
fn shutdown_reaps_every_open_handle() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "forever", "while :; do sleep 1; done", 0o755);
    let fs = ExecFs::new(ExecFsConfig {
        backing_root: temp.path().to_path_buf(),
        reap: ReapPolicy {
            exit_grace: Duration::ZERO,
            kill_grace: Duration::from_millis(50),
        },
        ..Default::default()
    })
    .unwrap();

    let pids: Vec<u32> = (0..3)
        .map(|_| {
            let handle = fs.open(Path::new("forever"), libc::O_RDONLY).unwrap();
            fs.pid(handle).unwrap()
        })
        .collect();

    fs.shutdown();
    assert_eq!(fs.open_handles(), 0);
    assert!(pids.into_iter().all(process_gone));
}

#[test]
fn missing_backing_root_is_rejected() {
    let err = ExecFs::new(ExecFsConfig {
        backing_root: PathBuf::from("/nonexistent/execfs-root"),
        ..Default::default()
    })
    .expect_err("missing root");
    assert!(matches!(err, Fault::NotFound));
}

#[test]
fn resolver_targets_distinguish_entry_kinds() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "tool", "true", 0o755);
    write_script(temp.path(), "notes", "true", 0o600);
    let fs = mount(&temp);
    let resolver = execfs_fs::Resolver::new(fs.root(), false);

    match resolver.resolve(Path::new("tool??a")).unwrap() {
        Target::Executable(vpath) => {
            assert_eq!(vpath.relative, PathBuf::from("tool"));
            assert_eq!(vpath.args, Some(vec!["a".into()]));
            assert_eq!(vpath.stdin, Some(execfs_fs::StdinSource::Null));
        }
        other => panic!("unexpected target {other:?}"),
    }
    assert!(matches!(
        resolver.resolve(Path::new("notes")).unwrap(),
        Target::Plain(_)
    ));
    assert!(matches!(
        resolver.resolve(Path::new("notes?x")),
        Err(Fault::NotFound)
    ));
}
