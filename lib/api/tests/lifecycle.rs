//! Every kind of handle follows the same lifecycle: usable while open,
//! idempotent close, a closed error afterwards, and a debug rendering that
//! names the kind.
use anyhow::Result;
use portos::{
    fs::{dir_open, file_open},
    net::{socket_create, Family, Protocol},
    proc::{pipe_create, proc_create},
    shm::shm_create,
    thread::{thread_create, thread_queue},
    type_of, AnyHandle, Errno, Runtime, Value,
};
use pretty_assertions::assert_eq;
use serial_test::serial;

fn nothing(_: Vec<Value>) -> Result<Vec<Value>> {
    Ok(Vec::new())
}

fn check(handle: AnyHandle, name: &str) {
    let value = Value::from(handle.clone());
    let kind = type_of(&value).expect("handles have a kind");
    assert_eq!(kind.to_string(), name);
    assert_eq!(handle.kind(), kind);

    let open = handle.to_string();
    assert!(
        open.starts_with(&format!("{name} (0x")) && open.ends_with(')'),
        "unexpected rendering {open:?}"
    );
    assert!(!handle.is_closed());

    handle.close().unwrap();
    handle.close().unwrap();
    assert!(handle.is_closed());
    assert_eq!(handle.to_string(), format!("{name} (closed)"));
    assert_eq!(value.to_string(), format!("{name} (closed)"));
}

#[test]
#[serial]
fn every_kind_shares_one_lifecycle() -> Result<()> {
    let _runtime = Runtime::init_default()?;
    let dir = tempfile::tempdir()?;

    let file = file_open(dir.path().join("f"), "w")?;
    check(file.clone().into(), "file");
    let err = file.write_bytes("late").unwrap_err();
    assert_eq!(err.code(), Errno::Closed);
    assert_eq!(err.message(), "attempt to use a closed file");

    check(socket_create(Protocol::Tcp, Family::Inet)?.into(), "socket");
    check(dir_open(dir.path())?.into(), "directory");
    check(proc_create("true")?.into(), "process");
    let (reader, writer) = pipe_create()?;
    check(reader.into(), "pipe");
    check(writer.into(), "pipe");
    check(thread_create(nothing, Vec::new())?.into(), "thread");
    check(thread_queue(1)?.into(), "thread queue");
    check(shm_create(dir.path().join("shm"), 8)?.into(), "shared memory");
    #[cfg(unix)]
    check(portos::net::pollset(1)?.into(), "pollset");
    Ok(())
}

#[test]
#[serial]
fn dropping_the_last_clone_finalizes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("buffered.txt");
    {
        let file = file_open(&path, "w")?;
        let clone = file.clone();
        assert_eq!(file.ref_count(), 2);
        drop(file);
        clone.write_bytes("flushed on drop")?;
    }
    let file = file_open(&path, "r")?;
    assert_eq!(&file.read_all()?[..], b"flushed on drop");

    let weak = file.downgrade();
    drop(file);
    assert!(weak.upgrade().is_none());
    Ok(())
}
