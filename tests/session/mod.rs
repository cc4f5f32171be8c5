/// End-to-end tests for sandbox sessions in direct and jailed mode
use serial_test::serial;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use jailbox::{
    config::SandboxConfig,
    lock_manager::LOCK_DIR_NAME,
    sandbox::SandboxSession,
    types::{ReadResult, SandboxError, SessionState},
};

use crate::{create_test_pool, create_work_dir};

const WAIT: Duration = Duration::from_secs(5);

fn direct_session(dir: &TempDir) -> SandboxSession {
    SandboxSession::new(dir.path(), Some(false), &SandboxConfig::default()).unwrap()
}

fn wait_for_exit(session: &mut SandboxSession) {
    let deadline = Instant::now() + WAIT;
    while session.is_alive() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!session.is_alive(), "command did not exit in time");
}

fn line(text: &str) -> ReadResult {
    ReadResult::Line(text.to_string())
}

#[test]
#[serial]
fn test_cat_echoes_lines() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);
    assert_eq!(session.state(), SessionState::Ready);
    assert!(!session.is_secure());

    session.start("cat").unwrap();
    assert!(session.is_alive());
    assert_eq!(session.state(), SessionState::Running);
    assert!(session.pid().is_some());

    assert!(session.write_line("hello"));
    assert_eq!(session.read_line(WAIT), line("hello"));

    session.kill().unwrap();
    assert!(!session.is_alive());
    assert_eq!(session.state(), SessionState::Dead);
    assert_eq!(session.read_line(WAIT), ReadResult::EndOfStream);
    assert_eq!(session.read_line(WAIT), ReadResult::Timeout);

    session.release().unwrap();
    assert_eq!(session.state(), SessionState::Released);
}

#[test]
#[serial]
fn test_output_order_and_single_end_marker() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);

    session.start("seq 3").unwrap();
    assert_eq!(session.read_line(WAIT), line("1"));
    assert_eq!(session.read_line(WAIT), line("2"));
    assert_eq!(session.read_line(WAIT), line("3"));
    assert_eq!(session.read_line(WAIT), ReadResult::EndOfStream);

    // Dead command, drained monitor: no waiting
    wait_for_exit(&mut session);
    let started = Instant::now();
    assert_eq!(session.read_line(Duration::from_secs(30)), ReadResult::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(session.active_monitors(), 0);

    session.release().unwrap();
}

#[test]
#[serial]
fn test_stderr_is_separate() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);

    session.start("sh -c 'echo oops 1>&2'").unwrap();
    assert_eq!(session.read_error(WAIT), line("oops"));
    assert_eq!(session.read_error(WAIT), ReadResult::EndOfStream);
    assert_eq!(session.read_line(WAIT), ReadResult::EndOfStream);

    session.kill().unwrap();
    session.release().unwrap();
}

#[test]
#[serial]
fn test_direct_mode_runs_in_working_directory() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("marker.txt"), "here").unwrap();
    let mut session = direct_session(&dir);
    assert_eq!(session.working_directory(), dir.path());

    session.start("ls").unwrap();
    assert_eq!(session.read_line(WAIT), line("marker.txt"));
    assert_eq!(session.read_line(WAIT), ReadResult::EndOfStream);

    session.kill().unwrap();
    session.release().unwrap();
}

#[test]
#[serial]
fn test_launch_failure_leaves_session_idle() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);

    let result = session.start("/nonexistent/jailbox-bot --fast");
    assert!(matches!(result, Err(SandboxError::LaunchFailed { .. })));
    assert!(!session.is_alive());
    assert_eq!(session.active_monitors(), 0);
    assert_eq!(session.state(), SessionState::Ready);
    assert!(!session.write_line("ignored"));

    // Still usable afterwards
    session.start("true").unwrap();
    session.kill().unwrap();
    session.release().unwrap();
}

#[test]
#[serial]
fn test_pause_and_resume() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);
    session.start("cat").unwrap();

    session.pause().unwrap();
    assert!(session.write_line("held"));
    assert_eq!(session.read_line(Duration::from_millis(300)), ReadResult::Timeout);

    session.resume().unwrap();
    assert_eq!(session.read_line(WAIT), line("held"));
    assert_eq!(session.read_line(Duration::from_millis(300)), ReadResult::Timeout);

    session.kill().unwrap();
    session.release().unwrap();
}

#[test]
#[serial]
fn test_lifecycle_errors() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);

    // Nothing running yet
    session.kill().unwrap();

    session.start("cat").unwrap();
    assert!(matches!(session.start("cat"), Err(SandboxError::AlreadyRunning)));
    assert!(matches!(session.retrieve(), Err(SandboxError::RetrieveWhileAlive)));
    assert!(matches!(session.release(), Err(SandboxError::ReleaseWhileAlive)));

    session.kill().unwrap();
    session.kill().unwrap();
    session.retrieve().unwrap();
    assert_eq!(session.state(), SessionState::Retrieved);

    session.release().unwrap();
    assert!(matches!(session.release(), Err(SandboxError::AlreadyReleased)));
    assert!(matches!(session.start("cat"), Err(SandboxError::AlreadyReleased)));
}

#[test]
#[serial]
fn test_write_after_exit_fails() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);

    session.start("true").unwrap();
    wait_for_exit(&mut session);
    assert!(!session.write_line("too late"));
    assert!(session.exit_status().map_or(false, |s| s.success()));

    session.release().unwrap();
}

#[test]
#[serial]
fn test_broken_stdin_kills_command() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);

    session.start("sh -c 'exec 0<&-; sleep 5'").unwrap();
    let started = Instant::now();
    let mut sent = true;
    while sent && started.elapsed() < WAIT {
        thread::sleep(Duration::from_millis(50));
        sent = session.write_line("ping");
    }

    assert!(!sent);
    assert!(!session.is_alive());
    assert!(started.elapsed() < Duration::from_secs(4));
    session.release().unwrap();
}

#[test]
#[serial]
fn test_dead_session_read_does_not_wait_on_grandchild() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);

    // The background sleep keeps stdout open after sh exits
    session.start("sh -c 'sleep 3 & echo hi'").unwrap();
    assert_eq!(session.read_line(WAIT), line("hi"));
    wait_for_exit(&mut session);

    let started = Instant::now();
    assert_eq!(session.read_line(Duration::from_secs(2)), ReadResult::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));
    session.release().unwrap();
}

#[test]
#[serial]
fn test_end_marker_once_per_run() {
    let dir = TempDir::new().unwrap();
    let mut session = direct_session(&dir);

    session.start("sh -c 'sleep 1 & echo a'").unwrap();
    assert_eq!(session.read_line(WAIT), line("a"));
    wait_for_exit(&mut session);

    // The first run's stream closes only after the second run has started
    session.start("true").unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut markers = 0;
    while Instant::now() < deadline {
        match session.read_line(Duration::from_millis(100)) {
            ReadResult::EndOfStream => markers += 1,
            ReadResult::Line(text) => panic!("unexpected output: {}", text),
            ReadResult::Timeout => thread::sleep(Duration::from_millis(10)),
        }
    }

    assert_eq!(markers, 1);
    session.release().unwrap();
}

#[test]
#[serial]
fn test_jailed_session_round_trip() {
    let pool = create_test_pool(1, 0);
    let work = create_work_dir(pool.dir.path());

    let mut session = SandboxSession::new(&work, None, &pool.config).unwrap();
    assert!(session.is_secure());
    let home = pool.base_dir().join("jailuser0/scratch/home/jailuser");
    assert_eq!(session.working_directory(), home.as_path());
    assert!(pool.base_dir().join("jailuser0").join(LOCK_DIR_NAME).exists());

    session.start(&format!("ls {}", home.display())).unwrap();
    assert_eq!(session.read_line(WAIT), line("bot.sh"));
    assert_eq!(session.read_line(WAIT), line("maps"));
    assert_eq!(session.read_line(WAIT), ReadResult::EndOfStream);

    // What the bot left behind comes back on retrieve
    fs::write(home.join("replay.txt"), "turn 1").unwrap();
    session.kill().unwrap();
    session.retrieve().unwrap();
    assert_eq!(fs::read_to_string(work.join("replay.txt")).unwrap(), "turn 1");
    assert!(work.join("maps/one.txt").exists());

    session.release().unwrap();
    assert!(!pool.base_dir().join("jailuser0").join(LOCK_DIR_NAME).exists());
    assert_eq!(pool.helper_calls(), vec!["c 0", "j 0", "c 0"]);
}

#[test]
#[serial]
fn test_jailed_signals_use_template() {
    let mut pool = create_test_pool(1, 0);
    let work = create_work_dir(pool.dir.path());

    let mut session = SandboxSession::new(&work, Some(true), &pool.config).unwrap();
    session.pause().unwrap();
    session.resume().unwrap();
    session.release().unwrap();

    pool.config.jail.signal_template = "false {signal}".to_string();
    let mut session = SandboxSession::new(&work, Some(true), &pool.config).unwrap();
    assert!(matches!(
        session.pause(),
        Err(SandboxError::SignalDeliveryFailed { .. })
    ));
    session.release().unwrap();
}

#[test]
#[serial]
fn test_staging_failure_abandons_slot() {
    let pool = create_test_pool(1, 1);
    let work = create_work_dir(pool.dir.path());

    let result = SandboxSession::new(&work, Some(true), &pool.config);
    assert!(matches!(result, Err(SandboxError::StagingFailed { slot: 0, .. })));
    assert!(pool.base_dir().join("jailuser0").join(LOCK_DIR_NAME).exists());

    let retry = SandboxSession::new(&work, Some(true), &pool.config);
    assert!(matches!(retry, Err(SandboxError::NoAvailableSlot { .. })));
}

#[test]
#[serial]
fn test_pool_exhaustion_and_reuse() {
    let pool = create_test_pool(1, 0);
    let work = create_work_dir(pool.dir.path());

    let mut first = SandboxSession::new(&work, Some(true), &pool.config).unwrap();
    assert!(matches!(
        SandboxSession::new(&work, Some(true), &pool.config),
        Err(SandboxError::NoAvailableSlot { .. })
    ));

    first.release().unwrap();
    let mut second = SandboxSession::new(&work, Some(true), &pool.config).unwrap();
    assert_eq!(second.slot().map(|s| s.id()), Some(0));
    second.release().unwrap();
}
