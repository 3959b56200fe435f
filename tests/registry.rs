#![cfg(unix)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use traffic_orchestrator::events::RunObserver;
use traffic_orchestrator::types::LaneStats;
use traffic_orchestrator::{
    OrchestratorConfig, RunError, RunParams, RunRegistry, RunSnapshot, RunStatus,
};

fn sh(script: &str) -> OrchestratorConfig {
    OrchestratorConfig {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        stop_timeout_ms: 500,
        exit_poll_interval_ms: 10,
        ..OrchestratorConfig::default()
    }
}

fn params(sim_time: u32) -> RunParams {
    RunParams {
        sim_time,
        min_green: 10,
        max_green: 60,
    }
}

async fn wait_for(
    registry: &RunRegistry,
    run_id: &str,
    done: impl Fn(&RunSnapshot) -> bool,
) -> RunSnapshot {
    let poll = async {
        loop {
            let snapshot = registry.get_run(run_id).unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("run did not reach the expected state")
}

async fn wait_terminal(registry: &RunRegistry, run_id: &str) -> RunSnapshot {
    wait_for(registry, run_id, |s| s.status.is_terminal()).await
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_run_carries_parsed_stats() {
    let registry = RunRegistry::new(sh(r#"
        echo "GREEN TS 1 -> r: 0 y: 5 g: $MIN_GREEN_TIME"
        echo "LANE_STATS lane=2 total=5 car=3 bus=1 truck=0 rickshaw=1 bike=0"
        echo "Lane 4: Total: 7"
        echo "Total vehicles passed: 40"
        echo "Total time passed: $SIM_TIME"
        echo "No. of vehicles passed per unit time: 0.4"
        echo "SIMULATION_COMPLETE"
    "#));
    let run_id = registry.create_run(params(100)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.run_id, run_id);
    assert_eq!(snapshot.params, params(100));
    let stats = &snapshot.stats;
    assert_eq!(stats.phase, "GREEN TS 1 -> r: 0 y: 5 g: 10");
    assert_eq!(
        stats.lanes[&2],
        LaneStats {
            total: 5,
            car: 3,
            bus: 1,
            truck: 0,
            rickshaw: 1,
            bike: 0
        }
    );
    assert_eq!(stats.lanes[&4].total, 7);
    assert_eq!(stats.lanes[&1], LaneStats::default());
    assert_eq!(stats.total_vehicles, 40);
    assert_eq!(stats.total_time, 100);
    assert_eq!(stats.throughput, 0.4);
    assert_eq!(stats.average_wait, 2.5);
    assert_eq!(stats.traffic_density, 10.0);
    assert_eq!(stats.congestion_level, 10.0);
    assert_eq!(snapshot.log.len(), 7);
    assert_eq!(snapshot.log.last().map(String::as_str), Some("SIMULATION_COMPLETE"));
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_exit_without_marker_finishes() {
    let registry = RunRegistry::new(sh("echo 'warming up' >&2; exit 0"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.log, vec!["warming up".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn nonzero_exit_is_an_error() {
    let registry = RunRegistry::new(sh("echo 'Total vehicles passed: 3'; exit 3"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    assert_eq!(snapshot.status, RunStatus::Error);
    assert_eq!(snapshot.stats.total_vehicles, 3);
    assert!(snapshot
        .log
        .contains(&"[system] simulation exited with code 3".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_marker_wins_over_later_exit_code() {
    let registry = RunRegistry::new(sh("echo SIMULATION_COMPLETE; exit 2"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_for(&registry, &run_id, |s| s.log.len() == 2).await;

    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.log[1], "[system] simulation exited with code 2");
}

#[tokio::test(flavor = "multi_thread")]
async fn launch_failure_resolves_to_error() {
    let config = OrchestratorConfig {
        program: "/nonexistent/traffic-sim".into(),
        ..OrchestratorConfig::default()
    };
    let registry = RunRegistry::new(config);
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    assert_eq!(snapshot.status, RunStatus::Error);
    assert_eq!(snapshot.log.len(), 1);
    assert!(snapshot.log[0].starts_with("[backend error] failed to launch simulation"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_graceful_and_idempotent() {
    let registry = RunRegistry::new(sh("echo started; exec sleep 30"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    wait_for(&registry, &run_id, |s| !s.log.is_empty()).await;

    let receipt = registry.stop_run(&run_id).await.unwrap();
    assert_eq!(receipt.run_id, run_id);
    assert_eq!(receipt.status, RunStatus::Stopped);

    let snapshot = wait_for(&registry, &run_id, |s| {
        s.log.iter().any(|l| l == "[system] simulation halted by user")
    })
    .await;
    assert_eq!(snapshot.status, RunStatus::Stopped);
    assert_eq!(
        snapshot.log,
        vec![
            "started".to_string(),
            "[system] stop requested by user".to_string(),
            "[system] simulation halted by user".to_string(),
        ]
    );

    let again = registry.stop_run(&run_id).await.unwrap();
    assert_eq!(again.status, RunStatus::Stopped);
    assert_eq!(registry.get_run(&run_id).unwrap().log, snapshot.log);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_kills_processes_that_ignore_sigterm() {
    let mut config = sh("trap '' TERM; echo ready; while :; do sleep 0.1; done");
    config.stop_timeout_ms = 300;
    let registry = RunRegistry::new(config);
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    wait_for(&registry, &run_id, |s| !s.log.is_empty()).await;

    registry.stop_run(&run_id).await.unwrap();
    let snapshot = registry.get_run(&run_id).unwrap();
    assert_eq!(snapshot.status, RunStatus::Stopped);
    assert!(snapshot
        .log
        .contains(&"[system] simulation did not exit within 300 ms; killed".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_a_finished_run_changes_nothing() {
    let registry = RunRegistry::new(sh("echo done"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let finished = wait_terminal(&registry, &run_id).await;
    assert_eq!(finished.status, RunStatus::Finished);

    for _ in 0..3 {
        let receipt = registry.stop_run(&run_id).await.unwrap();
        assert_eq!(receipt.status, RunStatus::Stopped);
    }
    let after = registry.get_run(&run_id).unwrap();
    assert_eq!(after.status, RunStatus::Finished);
    assert_eq!(after.log, finished.log);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_runs_are_not_found() {
    let registry = RunRegistry::new(sh("true"));
    assert!(matches!(
        registry.get_run("missing"),
        Err(RunError::NotFound(id)) if id == "missing"
    ));
    assert!(matches!(
        registry.stop_run("missing").await,
        Err(RunError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_params_create_nothing() {
    let registry = RunRegistry::new(sh("true"));
    let bad = RunParams {
        sim_time: 60,
        min_green: 40,
        max_green: 20,
    };
    assert!(matches!(
        registry.create_run(bad),
        Err(RunError::InvalidParams(_))
    ));
    assert!(registry.list_runs().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn run_ids_are_unique_under_concurrent_creation() {
    let registry = Arc::new(RunRegistry::new(sh("true")));
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            (0..5)
                .map(|_| registry.create_run(params(30)).unwrap().run_id)
                .collect::<Vec<_>>()
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        ids.extend(task.await.unwrap());
    }
    assert_eq!(ids.len(), 80);
    assert_eq!(registry.list_runs().len(), 80);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_returns_a_bounded_tail() {
    let registry = RunRegistry::new(sh(
        r#"i=0; while [ $i -lt 1200 ]; do echo "line $i"; i=$((i+1)); done"#,
    ));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.log.len(), 300);
    let expected: Vec<String> = (900..1200).map(|i| format!("line {i}")).collect();
    assert_eq!(snapshot.log, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_lane_lines_do_not_abort_the_run() {
    let registry = RunRegistry::new(sh(r#"
        echo "LANE_STATS lane=9 total=5 car=3 bus=1 truck=0 rickshaw=1 bike=0"
        echo "LANE_STATS lane=1 total=bad"
        echo "Total vehicles passed: 12"
    "#));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.log.len(), 3);
    assert!(snapshot.stats.lanes.values().all(|l| *l == LaneStats::default()));
    assert_eq!(snapshot.stats.lanes.len(), 4);
    assert_eq!(snapshot.stats.total_vehicles, 12);
}

#[derive(Default)]
struct Recorder {
    lines: Mutex<Vec<String>>,
    statuses: Mutex<Vec<RunStatus>>,
}

impl RunObserver for Recorder {
    fn on_line(&self, _run_id: &str, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn on_status(&self, _run_id: &str, status: RunStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn observer_sees_lines_and_final_status() {
    let recorder = Arc::new(Recorder::default());
    let registry = RunRegistry::with_observer(
        sh("echo one; echo two; echo SIMULATION_COMPLETE"),
        recorder.clone(),
    );
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    wait_terminal(&registry, &run_id).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.statuses.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        *recorder.lines.lock().unwrap(),
        vec!["one", "two", "SIMULATION_COMPLETE"]
    );
    assert_eq!(*recorder.statuses.lock().unwrap(), vec![RunStatus::Finished]);
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_wire_shape() {
    let registry = RunRegistry::new(sh("echo 'Total time passed: 5'"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    let value = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(value["run_id"], run_id.as_str());
    assert_eq!(value["status"], "finished");
    assert_eq!(value["params"]["sim_time"], 60);
    assert_eq!(value["log"][0], "Total time passed: 5");
    assert_eq!(value["stats"]["total_time"], 5);
    assert_eq!(value["stats"]["lanes"]["1"]["bike"], 0);
}

fn process_alive(pid: &str) -> bool {
    std::process::Command::new("sh")
        .args(["-c", &format!("kill -0 {pid}")])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_terminates_a_process_that_outlives_its_completion_marker() {
    let registry = RunRegistry::new(sh("echo \"pid $$\"; echo SIMULATION_COMPLETE; exec sleep 30"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let finished = wait_for(&registry, &run_id, |s| s.log.len() == 2).await;
    assert_eq!(finished.status, RunStatus::Finished);
    let pid = finished.log[0].trim_start_matches("pid ").to_string();
    assert!(process_alive(&pid));

    let receipt = tokio::time::timeout(Duration::from_secs(5), registry.stop_run(&run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(receipt.status, RunStatus::Stopped);
    assert!(!process_alive(&pid));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = registry.get_run(&run_id).unwrap();
    assert_eq!(after.status, RunStatus::Finished);
    assert_eq!(after.log, finished.log);
}

struct PanicsOnLine;

impl RunObserver for PanicsOnLine {
    fn on_line(&self, _run_id: &str, line: &str) {
        if line == "boom" {
            panic!("observer rejected line");
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_worker_resolves_to_error() {
    let registry =
        RunRegistry::with_observer(sh("echo boom; exec sleep 30"), Arc::new(PanicsOnLine));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    assert_eq!(snapshot.status, RunStatus::Error);
    assert_eq!(snapshot.log[0], "boom");
    assert!(snapshot.log[1].starts_with("[backend error] worker crashed"));

    // The crashed run no longer holds its process, so a stop has nothing to do.
    registry.stop_run(&run_id).await.unwrap();
    assert_eq!(registry.get_run(&run_id).unwrap().log, snapshot.log);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_output_resolves_to_error() {
    let registry = RunRegistry::new(sh(r"printf 'ok\n\377\376\n'; exec sleep 30"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    let snapshot = wait_terminal(&registry, &run_id).await;

    assert_eq!(snapshot.status, RunStatus::Error);
    assert_eq!(snapshot.log[0], "ok");
    assert!(snapshot.log[1].starts_with("[backend error] failed to read simulation output"));
    assert_eq!(snapshot.log.len(), 2);
}

// On a current-thread runtime the worker cannot start before the stop below
// completes, so the stop always lands before the child is attached.
#[tokio::test]
async fn stop_before_launch_halts_the_fresh_process() {
    let registry = RunRegistry::new(sh("echo started; exec sleep 30"));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    registry.stop_run(&run_id).await.unwrap();
    assert_eq!(
        registry.get_run(&run_id).unwrap().log,
        vec!["[system] stop requested by user".to_string()]
    );

    let snapshot = wait_for(&registry, &run_id, |s| s.log.len() == 2).await;
    assert_eq!(snapshot.status, RunStatus::Stopped);
    assert_eq!(
        snapshot.log,
        vec![
            "[system] stop requested by user".to_string(),
            "[system] simulation halted by user".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn output_after_stop_is_still_recorded() {
    let registry = RunRegistry::new(sh(
        "trap 'echo \"Total vehicles passed: 9\"; exit 0' TERM; echo ready; while :; do sleep 0.1; done",
    ));
    let run_id = registry.create_run(params(60)).unwrap().run_id;
    wait_for(&registry, &run_id, |s| !s.log.is_empty()).await;

    registry.stop_run(&run_id).await.unwrap();
    let snapshot = wait_for(&registry, &run_id, |s| {
        s.log.iter().any(|l| l == "[system] simulation halted by user")
    })
    .await;

    assert_eq!(snapshot.status, RunStatus::Stopped);
    assert_eq!(
        snapshot.log,
        vec![
            "ready".to_string(),
            "[system] stop requested by user".to_string(),
            "Total vehicles passed: 9".to_string(),
            "[system] simulation halted by user".to_string(),
        ]
    );
    assert_eq!(snapshot.stats.total_vehicles, 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshots_never_show_a_line_without_its_stats() {
    let registry = RunRegistry::new(sh(
        r#"i=1; while [ $i -le 2000 ]; do echo "Total vehicles passed: $i"; i=$((i+1)); done"#,
    ));
    let run_id = registry.create_run(params(60)).unwrap().run_id;

    let mut checked = 0;
    let snapshot = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = registry.get_run(&run_id).unwrap();
            if let Some(last) = snapshot.log.last() {
                let shown: u64 = last
                    .trim_start_matches("Total vehicles passed: ")
                    .parse()
                    .unwrap();
                assert_eq!(snapshot.stats.total_vehicles, shown, "log and stats disagree");
                checked += 1;
            } else {
                assert_eq!(snapshot.stats.total_vehicles, 0);
            }
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("run did not finish");

    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.stats.total_vehicles, 2000);
    assert!(checked > 0);
}
