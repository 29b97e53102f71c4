// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios exercising the loop, task groups, sleep and readiness I/O together.

use std::cell::RefCell;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use taskloop::{gather, read, run, sleep, task_group, Failure, RunError};

#[derive(Debug)]
struct Boom(&'static str);

impl std::fmt::Display for Boom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for Boom {}

/// Two sleepers logged in wake order, not spawn order.
#[test]
fn sleep_ordering() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let result = run({
        let log = log.clone();
        async move {
            let log_a = log.clone();
            let log_b = log.clone();
            gather(vec![
                Box::pin(async move {
                    sleep(Duration::from_millis(50)).await?;
                    log_a.borrow_mut().push("A");
                    Ok(())
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Failure>>>>,
                Box::pin(async move {
                    sleep(Duration::from_millis(10)).await?;
                    log_b.borrow_mut().push("B");
                    Ok(())
                }),
            ])
            .await
        }
    })
    .unwrap();

    assert_eq!(result.unwrap(), vec![(), ()]);
    assert_eq!(*log.borrow(), vec!["B", "A"]);
}

/// Children don't start until the parent next suspends.
#[test]
fn deferred_start() {
    let log = Rc::new(RefCell::new(Vec::new()));
    run({
        let log = log.clone();
        async move {
            let group = task_group();
            let child_log = log.clone();
            group.spawn::<(), _>("C", async move {
                child_log.borrow_mut().push("C");
                Ok(())
            });
            log.borrow_mut().push("P");
            group.close().await
        }
    })
    .unwrap()
    .unwrap();

    assert_eq!(*log.borrow(), vec!["P", "C"]);
}

/// A failing sibling cancels a long sleeper almost immediately.
#[test]
fn fan_out_cancellation() {
    let observed_cancel = Rc::new(RefCell::new(false));
    let start = Instant::now();
    let result = run({
        let observed_cancel = observed_cancel.clone();
        async move {
            let group = task_group();
            group.spawn::<(), _>("A", async move {
                match sleep(Duration::from_secs(1)).await {
                    Err(Failure::Cancelled) => {
                        observed_cancel.replace(true);
                        Err(Failure::Cancelled)
                    }
                    other => other,
                }
            });
            group.spawn::<(), _>("B", async move {
                sleep(Duration::from_millis(10)).await?;
                Err(Failure::user(Boom("BOOM")))
            });
            group.close().await
        }
    })
    .unwrap();

    let elapsed = start.elapsed();
    assert!(matches!(result, Err(Failure::User(_))));
    assert_eq!(result.unwrap_err().to_string(), "BOOM");
    assert!(*observed_cancel.borrow());
    assert!(elapsed < Duration::from_millis(500), "elapsed = {elapsed:?}");
}

/// Only the first non-cancellation failure survives.
#[test]
fn lost_secondary_failure() {
    let result = run(async move {
        let group = task_group();
        group.spawn::<(), _>("A", async move {
            match sleep(Duration::from_secs(1)).await {
                Err(Failure::Cancelled) => Err(Failure::user(Boom("X"))),
                other => other,
            }
        });
        group.spawn::<(), _>("B", async move { Err(Failure::user(Boom("Y"))) });
        group.close().await
    })
    .unwrap();

    assert_eq!(result.unwrap_err().to_string(), "Y");
}

/// Readiness-driven reads return exactly what's available, one OS read per wakeup.
#[test]
fn read_readiness() {
    let (reader, mut writer) = os_pipe();
    writer.write_all(b"hello").unwrap();
    drop(writer);

    let fd = reader.as_raw_fd();
    let bytes = run(async move { read(fd, 32).await }).unwrap();
    assert_eq!(bytes.unwrap(), b"hello");
    drop(reader);

    let (reader, mut writer) = os_pipe();
    writer.write_all(b"hello").unwrap();
    drop(writer);

    let fd = reader.as_raw_fd();
    let bytes = run(async move {
        let first = read(fd, 2).await?;
        let rest = read(fd, 32).await?;
        Ok::<_, Failure>((first, rest))
    })
    .unwrap()
    .unwrap();
    assert_eq!(bytes.0, b"he");
    assert_eq!(bytes.1, b"llo");
}

/// Awaiting a task that is never spawned deadlocks the loop.
#[test]
fn deadlock_detection() {
    let result = run(async move {
        let group = task_group();
        group.spawn::<(), _>("stuck", async move {
            std::future::pending::<()>().await;
            unreachable!()
        });
        group.close().await
    });

    // `pending()` never suspends through a registered wakeup source, so the loop has no
    // ready tasks, timers or watches left once it is the only thing running: deadlock.
    assert!(matches!(result, Err(RunError::Deadlock)));
}

fn os_pipe() -> (std::fs::File, std::fs::File) {
    use std::os::fd::FromRawFd;
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe {
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1]))
    }
}
