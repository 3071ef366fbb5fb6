//! Loopback protocol session: a server thread dispatching against memory
//! storage, driven by a remote storage client.

#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(unix)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;

use stanza_storage::{
    MemoryStorage, ProtocolClient, ProtocolServer, ReadParam, RemoteStorage, Storage,
    StorageError, WriteParam,
};

fn session() -> (
    RemoteStorage<UnixStream, UnixStream>,
    MemoryStorage,
    thread::JoinHandle<()>,
) {
    let (client_stream, server_stream) = UnixStream::pair().unwrap();
    let backend = MemoryStorage::new();

    let server_backend = backend.clone();
    let server_read = server_stream.try_clone().unwrap();
    let handle = thread::spawn(move || {
        let mut server =
            ProtocolServer::new("repo-host", server_read, server_stream, server_backend);
        server.run().unwrap();
    });

    let client_read = client_stream.try_clone().unwrap();
    let client = ProtocolClient::new("repo-host", client_read, client_stream);

    (RemoteStorage::new(client), backend, handle)
}

#[test]
fn write_then_read_round_trips() {
    let (remote, backend, handle) = session();

    let mut write = remote
        .new_write("archive/file.bin", WriteParam::new().mode(0o600))
        .unwrap();
    write.write_all(b"remote payload bytes").unwrap();
    write.close().unwrap();

    // Data landed in the backend
    assert_eq!(
        backend.contents("archive/file.bin").unwrap(),
        b"remote payload bytes"
    );

    let mut read = remote
        .new_read("archive/file.bin", ReadParam::new())
        .unwrap()
        .unwrap();
    let mut data = Vec::new();
    read.read_to_end(&mut data).unwrap();
    assert_eq!(data, b"remote payload bytes");

    remote.exit().unwrap();
    handle.join().unwrap();
}

#[test]
fn read_with_offset_and_limit() {
    let (remote, backend, handle) = session();

    let mut write = backend.new_write("f", WriteParam::new()).unwrap();
    write.write_all(b"0123456789").unwrap();
    write.close().unwrap();

    let mut read = remote
        .new_read("f", ReadParam::new().offset(4).limit(3))
        .unwrap()
        .unwrap();
    let mut data = Vec::new();
    read.read_to_end(&mut data).unwrap();
    assert_eq!(data, b"456");

    remote.exit().unwrap();
    handle.join().unwrap();
}

#[test]
fn missing_file_errors_are_raised_with_session_name() {
    let (remote, _backend, handle) = session();

    // ignore_missing yields None without an error
    assert!(remote
        .new_read("absent", ReadParam::new().ignore_missing())
        .unwrap()
        .is_none());

    // Without it, the remote error is re-raised naming the session
    let err = match remote.new_read("absent", ReadParam::new()) {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };

    match &err {
        StorageError::Raised { session, kind, .. } => {
            assert_eq!(session, "repo-host");
            assert_eq!(kind, "FileOpenError");
        }
        other => panic!("unexpected error {other}"),
    }

    assert!(err.to_string().starts_with("raised from repo-host: "));

    remote.exit().unwrap();
    handle.join().unwrap();
}

#[test]
fn info_list_and_remove() {
    let (remote, backend, handle) = session();

    for path in ["dir/a", "dir/b"] {
        let mut write = backend
            .new_write(path, WriteParam::new().time(1_700_000_000))
            .unwrap();
        write.write_all(b"xy").unwrap();
        write.close().unwrap();
    }

    let info = remote.info("dir/a", true).unwrap();
    assert!(info.exists);
    assert_eq!(info.size, 2);
    assert_eq!(info.time, 1_700_000_000);

    let mut names = remote.list("dir").unwrap();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);

    remote.remove("dir/a", true).unwrap();
    assert!(!remote.info("dir/a", true).unwrap().exists);

    // Missing without the error flag is quiet
    remote.remove("dir/a", false).unwrap();

    remote.exit().unwrap();
    handle.join().unwrap();
}

#[test]
fn session_survives_a_failed_command() {
    let (remote, backend, handle) = session();

    assert!(remote.new_read("absent", ReadParam::new()).is_err());

    // The session is still usable after the error response
    let mut write = remote.new_write("after-error", WriteParam::new()).unwrap();
    write.write_all(b"ok").unwrap();
    write.close().unwrap();

    assert_eq!(backend.contents("after-error").unwrap(), b"ok");

    remote.exit().unwrap();
    handle.join().unwrap();
}

#[test]
fn path_operations_round_trip() {
    let (remote, _backend, handle) = session();

    remote.path_create("base/sub", false, false, 0o750).unwrap();
    assert!(remote.info("base/sub", true).unwrap().exists);

    remote.path_sync("base/sub").unwrap();

    assert!(remote.path_remove("base/sub", false).unwrap());
    assert!(!remote.path_remove("base/sub", false).unwrap());

    remote.exit().unwrap();
    handle.join().unwrap();
}
