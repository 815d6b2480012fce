mod common;

use std::time::{Duration, Instant};

use common::{all_processes, job_is, Harness};
use taskmaster::jobs::{JobState, ProcessState};
use taskmaster::Error;

#[test]
fn pool_runs_then_stops_on_request() {
    let mut h = Harness::new(
        r#"
jobs:
  job1:
    cmd: "/bin/sleep 100"
    numprocs: 2
    autostart: true
    autorestart: false
    starttime: 1
"#,
    );
    h.manager.start_all();
    assert_eq!(h.job_state("job1"), Some(JobState::Starting));
    assert_eq!(h.states("job1"), vec![ProcessState::Starting; 2]);

    assert!(h.pump_until(Duration::from_secs(3), job_is("job1", JobState::Running)));
    let status = h.manager.status_of("job1").unwrap();
    assert_eq!(status.processes.len(), 2);
    assert!(status.processes.iter().all(|p| p.state == ProcessState::Running));
    assert_eq!(status.processes[0].name, "job1_0");
    assert_eq!(status.processes[1].name, "job1_1");

    h.manager.stop("job1").unwrap();
    assert_eq!(h.states("job1"), vec![ProcessState::Stopping; 2]);
    assert!(h.pump_until(Duration::from_secs(3), job_is("job1", JobState::Stopped)));
    let status = h.manager.status_of("job1").unwrap();
    assert_eq!(status.state, JobState::Stopped);
    assert!(status.processes.iter().all(|p| p.state == ProcessState::Stopped && p.pid.is_none()));
}

#[test]
fn restart_cap_parks_the_slot_in_backoff() {
    let mut h = Harness::new(
        r#"
jobs:
  crashy:
    cmd: "/bin/sh -c 'exit 1'"
    autorestart: true
    startretries: 2
    starttime: 5
"#,
    );
    h.manager.start_all();
    assert!(h.pump_until(Duration::from_secs(5), job_is("crashy", JobState::Stopped)));

    let process = &h.manager.job("crashy").unwrap().processes()[0];
    assert_eq!(process.state(), ProcessState::Backoff);
    assert_eq!(process.restarts(), 2);

    // parked for good
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        h.tick();
        assert_eq!(h.states("crashy"), vec![ProcessState::Backoff]);
    }

    // until someone asks
    h.manager.start("crashy").unwrap();
    assert_eq!(h.states("crashy"), vec![ProcessState::Starting]);
    assert_eq!(h.manager.job("crashy").unwrap().processes()[0].restarts(), 0);
    assert!(h.pump_until(Duration::from_secs(5), job_is("crashy", JobState::Stopped)));
}

#[test]
fn expected_exit_codes_are_not_restarted() {
    let mut h = Harness::new(
        r#"
jobs:
  clean:
    cmd: "/bin/sh -c 'exit 0'"
    autorestart: unexpected
    exitcodes: 0
    startretries: 3
    starttime: 5
  dirty:
    cmd: "/bin/sh -c 'exit 1'"
    autorestart: unexpected
    exitcodes: [0]
    startretries: 3
    starttime: 5
"#,
    );
    h.manager.start_all();
    let first_spawn = h.manager.job("clean").unwrap().processes()[0].started_at();
    assert!(first_spawn.is_some());
    assert!(h.pump_until(Duration::from_secs(5), |m| {
        m.job("clean").is_some_and(|j| j.state() == JobState::Stopped)
            && m.job("dirty").is_some_and(|j| j.state() == JobState::Stopped)
    }));

    let clean = &h.manager.job("clean").unwrap().processes()[0];
    assert_eq!(clean.exit_code(), Some(0));
    assert_eq!(clean.restarts(), 1);
    assert_eq!(clean.state(), ProcessState::Backoff);

    // parked: no second spawn ever happens
    h.pump_for(Duration::from_millis(300));
    let clean = &h.manager.job("clean").unwrap().processes()[0];
    assert_eq!(clean.started_at(), first_spawn);
    assert_eq!(clean.pid(), None);
    assert_eq!(clean.state(), ProcessState::Backoff);

    let dirty = &h.manager.job("dirty").unwrap().processes()[0];
    assert_eq!(dirty.restarts(), 3);
    assert_eq!(dirty.exit_code(), Some(1));
}

#[test]
fn auto_restart_puts_a_running_job_back_into_starting() {
    let mut h = Harness::new(
        r#"
jobs:
  flap:
    cmd: "/bin/sh -c 'sleep 1.5; exit 1'"
    autorestart: true
    startretries: 3
    starttime: 1
"#,
    );
    h.manager.start_all();
    assert!(h.pump_until(Duration::from_secs(3), job_is("flap", JobState::Running)));

    assert!(h.pump_until(Duration::from_secs(3), |m| {
        m.job("flap").is_some_and(|j| j.processes()[0].restarts() == 1)
    }));
    assert_eq!(h.states("flap"), vec![ProcessState::Starting]);
    assert_eq!(h.job_state("flap"), Some(JobState::Starting));

    // the new child outlives starttime again
    assert!(h.pump_until(Duration::from_secs(3), job_is("flap", JobState::Running)));
    assert_eq!(h.states("flap"), vec![ProcessState::Running]);

    h.manager.stop("flap").unwrap();
    assert!(h.pump_until(Duration::from_secs(3), job_is("flap", JobState::Stopped)));
}

#[test]
fn starting_twice_changes_nothing() {
    let mut h = Harness::new("jobs:\n  web:\n    cmd: /bin/sleep 30\n    numprocs: 3\n    starttime: 0\n");
    h.manager.start_all();
    assert!(h.pump_until(Duration::from_secs(3), job_is("web", JobState::Running)));
    let pids = h.pids("web");
    assert_eq!(pids.len(), 3);

    h.manager.start("web").unwrap();
    h.manager.start("web").unwrap();
    h.pump_for(Duration::from_millis(200));
    assert_eq!(h.pids("web"), pids);
    assert_eq!(h.job_state("web"), Some(JobState::Running));
}

#[test]
fn processes_pass_through_starting() {
    let mut h = Harness::new("jobs:\n  web:\n    cmd: /bin/sleep 30\n    starttime: 1\n    autostart: false\n");
    assert_eq!(h.job_state("web"), Some(JobState::Empty));

    let mut seen = Vec::new();
    h.manager.start("web").unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && h.job_state("web") != Some(JobState::Running) {
        seen.extend(h.states("web"));
        h.tick();
    }
    seen.extend(h.states("web"));
    seen.dedup();
    assert_eq!(seen, vec![ProcessState::Starting, ProcessState::Running]);

    h.manager.stop("web").unwrap();
    assert!(h.pump_until(Duration::from_secs(3), job_is("web", JobState::Stopped)));
    h.manager.start("web").unwrap();
    assert_eq!(h.states("web"), vec![ProcessState::Starting]);
}

#[test]
fn term_ignorers_are_killed_after_stoptime() {
    let mut h = Harness::new(
        r#"
jobs:
  stubborn:
    cmd: "/bin/sh -c \"trap '' TERM; sleep 30\""
    starttime: 0
    stoptime: 1
"#,
    );
    h.manager.start_all();
    assert!(h.pump_until(Duration::from_secs(3), job_is("stubborn", JobState::Running)));
    // let the shell install its trap
    h.pump_for(Duration::from_millis(300));

    let asked = Instant::now();
    h.manager.stop("stubborn").unwrap();
    h.pump_for(Duration::from_millis(700));
    assert_eq!(h.states("stubborn"), vec![ProcessState::Stopping]);

    assert!(h.pump_until(Duration::from_secs(5), job_is("stubborn", JobState::Stopped)));
    assert!(asked.elapsed() >= Duration::from_secs(1));
    assert_eq!(h.states("stubborn"), vec![ProcessState::Stopped]);
}

#[test]
fn configured_stop_signal_is_used() {
    let mut h = Harness::new(
        r#"
jobs:
  polite:
    cmd: "/bin/sh -c \"trap '' TERM; trap 'exit 0' INT; while true; do sleep 0.1; done\""
    starttime: 0
    stopsignal: INT
    stoptime: 10
"#,
    );
    h.manager.start_all();
    assert!(h.pump_until(Duration::from_secs(3), job_is("polite", JobState::Running)));
    h.pump_for(Duration::from_millis(300));

    let asked = Instant::now();
    h.manager.stop("polite").unwrap();
    assert!(h.pump_until(Duration::from_secs(5), job_is("polite", JobState::Stopped)));
    assert!(asked.elapsed() < Duration::from_secs(5));
    assert_eq!(h.manager.job("polite").unwrap().processes()[0].exit_code(), Some(0));
}

#[test]
fn restart_replaces_every_pid() {
    let mut h = Harness::new("jobs:\n  web:\n    cmd: /bin/sleep 30\n    numprocs: 2\n    starttime: 0\n");
    h.manager.start_all();
    assert!(h.pump_until(Duration::from_secs(3), job_is("web", JobState::Running)));
    let before = h.pids("web");

    h.manager.restart("web").unwrap();
    assert_eq!(h.job_state("web"), Some(JobState::Starting));
    assert!(h.pump_until(Duration::from_secs(5), all_processes("web", ProcessState::Running)));
    let after = h.pids("web");
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|pid| !before.contains(pid)));
}

#[test]
fn unknown_jobs_are_reported() {
    let mut h = Harness::new("jobs:\n  web:\n    cmd: /bin/sleep 30\n    autostart: false\n");
    assert!(matches!(h.manager.start("nope"), Err(Error::JobNotFound(name)) if name == "nope"));
    assert!(matches!(h.manager.stop("nope"), Err(Error::JobNotFound(_))));
    assert!(matches!(h.manager.restart("nope"), Err(Error::JobNotFound(_))));
    assert!(matches!(h.manager.status_of("nope"), Err(Error::JobNotFound(_))));

    // stopping something that never ran is fine
    h.manager.stop("web").unwrap();
    h.tick();
    assert_eq!(h.job_state("web"), Some(JobState::Empty));
}

#[test]
fn shutdown_refuses_new_work() {
    let mut h = Harness::new("jobs:\n  web:\n    cmd: /bin/sleep 30\n    starttime: 0\n");
    h.manager.start_all();
    assert!(h.pump_until(Duration::from_secs(3), job_is("web", JobState::Running)));

    h.manager.kill();
    assert!(h.manager.is_shutting_down());
    assert!(matches!(h.manager.start("web"), Err(Error::ShuttingDown)));
    assert!(h.pump_until(Duration::from_secs(3), |m| !m.has_live_processes()));
    assert_eq!(h.job_state("web"), Some(JobState::Stopped));
}
