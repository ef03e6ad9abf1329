//! S6: POSIX AIO plumbing exercised directly against a real file, without
//! the full acceptor/handler wiring (no `ConnectionHandler` currently has a
//! path to `Acceptor::submit_aio`; see DESIGN.md). Ignored by default since
//! it depends on the host's AIO implementation actually delivering a
//! completion, which some container/sandbox kernels suppress.

use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use corehttpd::net::aio::{arm_and_submit, submit_read, AioArena};
use corehttpd::net::signal::aio_signal;

#[test]
#[ignore]
fn submitted_read_completes_with_file_contents() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"the quick brown fox").unwrap();
    file.flush().unwrap();

    let fd = file.as_file().as_raw_fd();
    let record = submit_read(fd, 0, 32, aio_signal()).unwrap();

    let mut arena = AioArena::new();
    let id = arena.insert(0, record);
    arm_and_submit(&mut arena.get_mut(id).unwrap().record).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if arena.get(id).unwrap().record.is_complete() {
            break;
        }
        assert!(Instant::now() < deadline, "aio_read never completed");
        std::thread::sleep(Duration::from_millis(10));
    }

    let entry = arena.remove(id).unwrap();
    let mut record = entry.record;
    record.finish();
    assert_eq!(record.error, 0);
    assert_eq!(&record.buffer[..record.bytes_done], b"the quick brown fox");
}
