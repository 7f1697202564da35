//! Cross-subsystem scenarios: the file layer over the process table, the
//! RTC file backend, directory enumeration, and the run queue.

#![cfg(test)]

use crate::{
    fs::{file, image, testfs::ImageBuilder},
    process, sched, syscall, tty,
};

/// Mount a sample image and stand up a live process bound to terminal 0.
fn setup_world() -> usize {
    process::init();
    tty::init();
    sched::init();
    let fs_image = ImageBuilder::new()
        .rtc("rtc")
        .file("frame0.txt", b"the quick brown fox")
        .file("frame1.txt", &[0x55; 6000])
        .executable("shell", 0x0804_8054, 5000)
        .build_static();
    image::init(fs_image).unwrap();

    let pid = process::allocate_pid().unwrap();
    process::with_slot(pid, |pcb| {
        pcb.in_use = true;
        pcb.pid = pid;
        pcb.tid = 0;
        file::release_all(pcb);
        file::install_stdio(pcb);
    })
    .unwrap();
    process::set_current(Some(pid));
    pid
}

fn teardown(pid: usize) {
    process::set_current(None);
    process::release_pid(pid);
    process::init();
}

#[test]
fn directory_enumeration_reads_every_name_once() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    let fd = file::open_by_name(b".").unwrap();
    assert!(fd >= file::FIRST_DYNAMIC_FD);

    let expected: [&[u8]; 5] = [b".", b"rtc", b"frame0.txt", b"frame1.txt", b"shell"];
    for name in expected {
        let mut buf = [0u8; 32];
        let read = file::read_fd(fd, &mut buf).unwrap();
        assert_eq!(&buf[..read], name);
    }
    // End of the directory: a zero-byte read.
    let mut buf = [0u8; 32];
    assert_eq!(file::read_fd(fd, &mut buf).unwrap(), 0);

    file::close_fd(fd).unwrap();
    teardown(pid);
}

#[test]
fn regular_file_position_is_per_fd() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    let fd_a = file::open_by_name(b"frame0.txt").unwrap();
    let fd_b = file::open_by_name(b"frame0.txt").unwrap();
    assert_ne!(fd_a, fd_b);

    let mut buf = [0u8; 9];
    assert_eq!(file::read_fd(fd_a, &mut buf).unwrap(), 9);
    assert_eq!(&buf, b"the quick");

    // The second fd still starts at the beginning.
    let mut buf_b = [0u8; 3];
    assert_eq!(file::read_fd(fd_b, &mut buf_b).unwrap(), 3);
    assert_eq!(&buf_b, b"the");

    // And the first continues where it left off, down to EOF.
    let mut rest = [0u8; 32];
    assert_eq!(file::read_fd(fd_a, &mut rest).unwrap(), 10);
    assert_eq!(&rest[..10], b" brown fox");
    assert_eq!(file::read_fd(fd_a, &mut rest).unwrap(), 0);

    file::close_fd(fd_a).unwrap();
    file::close_fd(fd_b).unwrap();
    teardown(pid);
}

#[test]
fn writes_to_readonly_backends_fail() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    let fd = file::open_by_name(b"frame0.txt").unwrap();
    assert_eq!(syscall::sys_write(fd as i32, b"nope"), -1);
    let dir = file::open_by_name(b".").unwrap();
    assert_eq!(syscall::sys_write(dir as i32, b"nope"), -1);
    // stdin is not readable-by-write either.
    assert_eq!(syscall::sys_read(1, &mut [0u8; 4]), -1);

    file::close_fd(fd).unwrap();
    file::close_fd(dir).unwrap();
    teardown(pid);
}

#[test]
fn stdio_fds_are_pinned() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    assert_eq!(syscall::sys_close(0), -1);
    assert_eq!(syscall::sys_close(1), -1);
    // Both still present afterwards.
    process::with_pcb(pid, |pcb| {
        assert!(pcb.files[0].present);
        assert!(pcb.files[1].present);
    })
    .unwrap();

    teardown(pid);
}

#[test]
fn rtc_rate_validation_through_the_file_layer() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    let fd = file::open_by_name(b"rtc").unwrap();
    // 64 Hz is a valid power of two.
    assert_eq!(syscall::sys_write(fd as i32, &64u32.to_le_bytes()), 0);
    assert_eq!(process::with_pcb(pid, |pcb| pcb.rtc_rate).unwrap(), 64);
    // 3 Hz is not.
    assert_eq!(syscall::sys_write(fd as i32, &3u32.to_le_bytes()), -1);
    // 2048 exceeds the hardware rate.
    assert_eq!(syscall::sys_write(fd as i32, &2048u32.to_le_bytes()), -1);
    // A short buffer cannot carry a rate.
    assert_eq!(syscall::sys_write(fd as i32, &[64u8]), -1);

    file::close_fd(fd).unwrap();
    teardown(pid);
}

#[test]
fn fd_exhaustion_and_reuse() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    // Six dynamic slots on top of stdio.
    let mut fds = [0usize; 6];
    for fd in fds.iter_mut() {
        *fd = file::open_by_name(b"frame0.txt").unwrap();
    }
    assert_eq!(syscall::sys_open(b"frame0.txt"), -1);

    // Closing one slot makes exactly that slot reusable.
    file::close_fd(fds[2]).unwrap();
    assert_eq!(syscall::sys_open(b"frame1.txt"), fds[2] as isize);

    teardown(pid);
}

#[test]
fn run_enqueues_without_blocking() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    assert_eq!(syscall::sys_run(b"counter 5", 1), 0);
    assert_eq!(syscall::sys_run(b"daemon", -1), 0);
    assert_eq!(sched::pending_count(), 2);
    // Bad terminal ids are rejected up front.
    assert_eq!(syscall::sys_run(b"counter", 3), -1);
    assert_eq!(syscall::sys_run(b"counter", -2), -1);

    sched::init();
    teardown(pid);
}

#[test]
fn halt_status_lands_in_the_parent_pcb() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    // A child whose parent is the process from setup_world.
    let child = process::allocate_pid().unwrap();
    process::with_slot(child, |pcb| {
        pcb.in_use = true;
        pcb.pid = child;
        pcb.parent = pid;
        pcb.tid = 0;
    })
    .unwrap();

    // The status write halt performs, without the context switch.
    process::with_pcb(pid, |pcb| pcb.child_status = 42).unwrap();
    assert_eq!(process::with_pcb(pid, |pcb| pcb.child_status).unwrap(), 42);

    process::release_pid(child);
    assert!(process::pid_is_free(child));
    teardown(pid);
}

#[test]
fn crashed_children_report_256() {
    let _guard = crate::test_lock();
    let pid = setup_world();

    process::mark_current_crashed();
    let crashed = process::with_pcb(pid, |pcb| pcb.crashed).unwrap();
    assert!(crashed);
    // 256 is outside any 8-bit user exit status.
    assert!(process::CRASH_STATUS > 255);

    teardown(pid);
}
